//! Client implementation.
//!
//! The client maintains:
//! - A reliable control stream (greeting, profile updates, broadcasts)
//! - An unreliable datagram channel, opened on demand via the server
//! - Buffers of received rider updates, rosters, and broadcasts
//!
//! It is poll-driven: callers pump [`RelayClient::poll_control`] and
//! [`RelayClient::poll_datagram`] from their own loop.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use relay_shared::config::RelayConfig;
use relay_shared::envelope::{
    Envelope, ACTION_BROADCAST, ACTION_CREATE_UDP_CHANNEL, ACTION_LIST_CLIENTS,
    ACTION_RIDER_STATUS_UPDATE, ACTION_UPDATE_STATUS, ACTION_UPDATE_USER, ACTION_WELCOME,
};
use relay_shared::net::{ReliableConn, UnreliableConn};
use relay_shared::profile::{RiderStatus, StatusUpdate, UserUpdate};

/// High-level relay client.
pub struct RelayClient {
    server_ip: IpAddr,
    reliable: ReliableConn,
    unreliable: Option<UnreliableConn>,

    /// Port of the server-side datagram channel, once granted.
    pub udp_port: Option<u16>,
    /// Status updates received from scene peers.
    pub rider_updates: Vec<RiderStatus>,
    /// Most recent roster reply, verbatim.
    pub roster: Option<String>,
    /// Relayed broadcast frames, verbatim.
    pub broadcasts: Vec<Vec<u8>>,
}

impl RelayClient {
    /// Connects to the relay and waits for its greeting.
    pub async fn connect(cfg: &RelayConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;

        info!(server = %server_addr, "Connecting to relay");
        let mut reliable = ReliableConn::connect(server_addr).await?;

        let greeting = reliable
            .recv()
            .await?
            .context("server closed before greeting")?;
        let envelope = Envelope::from_bytes(&greeting)?;
        if envelope.action != ACTION_WELCOME {
            debug!(action = %envelope.action, "unexpected greeting action");
        }
        info!(server = %server_addr, "Connected to relay");

        Ok(Self {
            server_ip: server_addr.ip(),
            reliable,
            unreliable: None,
            udp_port: None,
            rider_updates: Vec::new(),
            roster: None,
            broadcasts: Vec::new(),
        })
    }

    async fn send_action(&mut self, action: &str, data: String) -> anyhow::Result<Vec<u8>> {
        let bytes = Envelope::new(action, data).to_bytes()?;
        self.reliable.send(&bytes).await?;
        Ok(bytes)
    }

    /// Asks the server to open a datagram channel; the granted port
    /// arrives later through [`RelayClient::poll_control`].
    pub async fn create_udp_channel(&mut self) -> anyhow::Result<()> {
        self.send_action(ACTION_CREATE_UDP_CHANNEL, String::new())
            .await?;
        Ok(())
    }

    pub async fn update_user(&mut self, update: &UserUpdate) -> anyhow::Result<()> {
        let data = serde_json::to_string(update).context("serialize user update")?;
        self.send_action(ACTION_UPDATE_USER, data).await?;
        Ok(())
    }

    pub async fn update_status(&mut self, update: &StatusUpdate) -> anyhow::Result<()> {
        let data = serde_json::to_string(update).context("serialize status update")?;
        self.send_action(ACTION_UPDATE_STATUS, data).await?;
        Ok(())
    }

    /// Broadcasts a message to scene peers. Returns the framed envelope
    /// bytes, which arrive at each peer unchanged.
    pub async fn broadcast(&mut self, message: &str) -> anyhow::Result<Vec<u8>> {
        self.send_action(ACTION_BROADCAST, message.to_string()).await
    }

    /// Requests the roster; the reply lands in [`RelayClient::roster`].
    pub async fn list_clients(&mut self) -> anyhow::Result<()> {
        self.send_action(ACTION_LIST_CLIENTS, String::new()).await?;
        Ok(())
    }

    /// Sends an uninterpreted payload (the server drops it with a log
    /// line; useful for wire-level experiments).
    pub async fn send_raw(&mut self, data: &str) -> anyhow::Result<()> {
        self.send_action("data", data.to_string()).await?;
        Ok(())
    }

    pub fn has_udp_channel(&self) -> bool {
        self.unreliable.is_some()
    }

    /// Sends a datagram to the server for scene fan-out.
    pub async fn send_datagram(&self, payload: &[u8]) -> anyhow::Result<()> {
        let conn = self
            .unreliable
            .as_ref()
            .context("no udp channel; request one with create_udp_channel")?;
        conn.send(payload).await
    }

    /// Receives one relayed datagram within the deadline.
    pub async fn poll_datagram(&self, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        match &self.unreliable {
            Some(conn) => conn.recv_timeout(timeout).await,
            None => Ok(None),
        }
    }

    /// Processes at most one pending control message. Returns whether a
    /// message was handled; a closed connection surfaces as an error.
    pub async fn poll_control(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        let Some(frame) = self.reliable.recv_timeout(timeout).await? else {
            return Ok(false);
        };

        let envelope = match Envelope::from_bytes(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "malformed envelope from server, dropping");
                return Ok(true);
            }
        };

        match envelope.action.as_str() {
            ACTION_CREATE_UDP_CHANNEL => self.open_udp_channel(&envelope.data).await?,
            ACTION_RIDER_STATUS_UPDATE => match serde_json::from_str(&envelope.data) {
                Ok(status) => self.rider_updates.push(status),
                Err(e) => warn!(error = %e, "bad rider status payload, dropping"),
            },
            ACTION_LIST_CLIENTS => self.roster = Some(envelope.data),
            ACTION_BROADCAST => self.broadcasts.push(frame),
            ACTION_WELCOME => debug!("repeated greeting ignored"),
            other => debug!(action = %other, "unhandled action from server"),
        }
        Ok(true)
    }

    /// Handles the server's UDP-port grant: connect the datagram socket
    /// and send the discovery probe so the server learns our address.
    async fn open_udp_channel(&mut self, data: &str) -> anyhow::Result<()> {
        if self.unreliable.is_some() {
            debug!("udp channel already open, ignoring grant");
            return Ok(());
        }
        let port: u16 = data.trim().parse().context("parse granted udp port")?;

        let bind = match self.server_ip {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let peer = SocketAddr::new(self.server_ip, port);
        let conn = UnreliableConn::connect(bind, peer).await?;
        conn.send_probe().await?;

        info!(port, "udp channel open");
        self.udp_port = Some(port);
        self.unreliable = Some(conn);
        Ok(())
    }
}
