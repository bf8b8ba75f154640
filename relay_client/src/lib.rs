//! `relay_client`
//!
//! Client-side systems:
//! - Connection management (reliable + on-demand unreliable channel)
//! - Control actions: profile updates, broadcast, roster, udp channel
//! - Poll-driven receive buffers for relayed traffic

pub mod client;

pub use client::RelayClient;
