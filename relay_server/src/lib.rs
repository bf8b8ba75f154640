//! `relay_server`
//!
//! Server-side systems:
//! - Accept loop and per-client transports
//! - Control-action dispatch (udp channel, status, roster, broadcast)
//! - Scene-scoped fan-out on both channels
//! - UDP port allocation for datagram channels
//!
//! Networking model:
//! - TCP: framed control plane, one reader task per client
//! - UDP: one lazily created datagram channel per client

pub mod hub;
pub mod ports;
pub mod transport;

pub use hub::RelayServer;
