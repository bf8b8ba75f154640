//! The relay hub: registry of live transports, control-action dispatch,
//! and scene-scoped fan-out over both channels.
//!
//! Concurrency model:
//! - One task per reliable reader, one per datagram reader, one accept
//!   loop; all mutation of the registry funnels through hub methods.
//! - Fan-out iterates a snapshot taken under the registry lock and sends
//!   with the lock released, so a slow receiver cannot stall dispatch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use relay_shared::config::RelayConfig;
use relay_shared::envelope::{
    ControlMsg, Envelope, ACTION_CREATE_UDP_CHANNEL, ACTION_LIST_CLIENTS,
    ACTION_RIDER_STATUS_UPDATE, ACTION_WELCOME,
};
use relay_shared::net::{DatagramChannel, ReliableConn, ReliableListener};

use crate::ports::PortAllocator;
use crate::transport::{run_datagram, run_reliable, Transport};

/// Shared relay state reachable from every reader task.
pub struct Hub {
    clients: Mutex<Vec<Arc<Transport>>>,
    next_id: AtomicU64,
    ports: PortAllocator,
    shutdown_tx: watch::Sender<bool>,
}

impl Hub {
    fn new(ports: PortAllocator) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            ports,
            shutdown_tx,
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn clients_snapshot(&self) -> Vec<Arc<Transport>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Registers a freshly accepted connection: assign an id, append to
    /// the registry (before the reader starts, so the client is visible
    /// for fan-out from its first message), greet, spawn the reader.
    pub(crate) async fn on_new_connection(self: &Arc<Self>, conn: ReliableConn, addr: SocketAddr) {
        if self.is_shutting_down() {
            debug!(peer = %addr, "shutting down, dropping new connection");
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reader, writer) = conn.into_split();
        let tp = Transport::new(id, addr, writer);

        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tp.clone());
        info!(client_id = id, peer = %addr, "Client connected");

        let greeting = Envelope::new(ACTION_WELCOME, "");
        if let Err(e) = self.send_envelope(&tp, &greeting).await {
            warn!(client_id = id, error = %e, "greeting failed");
            self.close_transport(&tp);
            return;
        }

        tokio::spawn(run_reliable(self.clone(), tp, reader));
    }

    /// Removes a transport from the registry and stops its readers.
    /// Latched: only the first caller acts, so the removal happens exactly
    /// once no matter which reader exits first.
    pub(crate) fn close_transport(&self, tp: &Arc<Transport>) {
        if !tp.mark_closed() {
            return;
        }
        tp.stop();
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|c| c.id() != tp.id());
        info!(client_id = tp.id(), "Client removed");
    }

    /// Parses and dispatches one control envelope from `tp`.
    pub(crate) async fn on_reliable_received(self: &Arc<Self>, tp: &Arc<Transport>, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(client_id = tp.id(), error = %e, "malformed control envelope, dropping");
                return;
            }
        };

        match ControlMsg::parse(&envelope) {
            Ok(ControlMsg::CreateUdpChannel) => self.create_udp_channel(tp).await,
            Ok(ControlMsg::UpdateUser(update)) => {
                debug!(client_id = tp.id(), user_id = %update.user_id, "user profile updated");
                tp.apply_user(&update);
            }
            Ok(ControlMsg::UpdateStatus(update)) => {
                tp.apply_status(&update);
                self.fan_out_status(tp).await;
            }
            Ok(ControlMsg::ListClients) => self.send_roster(tp).await,
            Ok(ControlMsg::Broadcast) => self.fan_out_reliable(tp, bytes).await,
            Ok(ControlMsg::Other(action)) => {
                debug!(client_id = tp.id(), action = %action, "unhandled action, dropping");
            }
            Err(e) => {
                warn!(client_id = tp.id(), error = %e, "bad control payload, dropping");
            }
        }
    }

    /// Fans an inbound datagram out to the sender's scene peers.
    pub(crate) async fn on_unreliable_received(&self, tp: &Arc<Transport>, bytes: &[u8]) {
        for peer in self.scene_peers(tp) {
            peer.send_unreliable(bytes).await;
        }
    }

    /// Allocates a datagram channel for `tp` and replies with the bound
    /// port. A repeated request is dropped; allocation failure drops the
    /// request without a reply.
    async fn create_udp_channel(self: &Arc<Self>, tp: &Arc<Transport>) {
        if tp.has_datagram() {
            debug!(client_id = tp.id(), "udp channel already exists, ignoring request");
            return;
        }

        let socket = match self.ports.bind().await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(client_id = tp.id(), error = %e, "udp channel allocation failed");
                return;
            }
        };
        let port = match socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!(client_id = tp.id(), error = %e, "udp local addr unavailable");
                return;
            }
        };

        let channel = DatagramChannel::new(socket);
        if !tp.attach_datagram(channel.clone()) {
            debug!(client_id = tp.id(), "udp channel raced an earlier request, ignoring");
            return;
        }
        tokio::spawn(run_datagram(self.clone(), tp.clone(), channel));
        info!(client_id = tp.id(), port, "udp channel created");

        let reply = Envelope::new(ACTION_CREATE_UDP_CHANNEL, port.to_string());
        if let Err(e) = self.send_envelope(tp, &reply).await {
            warn!(client_id = tp.id(), error = %e, "udp channel reply failed");
            self.close_transport(tp);
        }
    }

    /// Synthesizes `rider_status_update` from the sender's profile and
    /// fans it out reliably to its scene peers.
    async fn fan_out_status(&self, tp: &Arc<Transport>) {
        let status = tp.status_update();
        let data = match serde_json::to_string(&status) {
            Ok(data) => data,
            Err(e) => {
                warn!(client_id = tp.id(), error = %e, "status serialization failed");
                return;
            }
        };
        let envelope = Envelope::new(ACTION_RIDER_STATUS_UPDATE, data);
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(client_id = tp.id(), error = %e, "status envelope failed");
                return;
            }
        };
        self.fan_out_reliable(tp, &bytes).await;
    }

    /// Delivers `bytes` unchanged to every other live transport in the
    /// sender's scene. A recipient's send error closes that recipient only.
    async fn fan_out_reliable(&self, sender: &Arc<Transport>, bytes: &[u8]) {
        for peer in self.scene_peers(sender) {
            if let Err(e) = peer.send_reliable(bytes).await {
                warn!(client_id = peer.id(), error = %e, "fan-out send failed, closing client");
                self.close_transport(&peer);
            }
        }
    }

    /// Live transports sharing the sender's scene, sender excluded.
    fn scene_peers(&self, sender: &Arc<Transport>) -> Vec<Arc<Transport>> {
        let scene = sender.scene_id();
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.id() != sender.id() && c.scene_id() == scene)
            .cloned()
            .collect()
    }

    /// Replies with the roster: one `"<id>, <profile json>\n"` line per
    /// client, in registry order.
    async fn send_roster(&self, tp: &Arc<Transport>) {
        let mut data = String::new();
        for client in self.clients_snapshot() {
            match client.profile_json() {
                Ok(json) => {
                    data.push_str(&format!("{}, {}\n", client.id(), json));
                }
                Err(e) => {
                    warn!(client_id = client.id(), error = %e, "profile serialization failed");
                }
            }
        }
        let reply = Envelope::new(ACTION_LIST_CLIENTS, data);
        if let Err(e) = self.send_envelope(tp, &reply).await {
            warn!(client_id = tp.id(), error = %e, "roster reply failed");
            self.close_transport(tp);
        }
    }

    async fn send_envelope(&self, tp: &Arc<Transport>, envelope: &Envelope) -> anyhow::Result<()> {
        tp.send_reliable(&envelope.to_bytes()?).await
    }
}

/// Accept loop: hands new connections to the hub until shutdown.
async fn accept_loop(hub: Arc<Hub>, listener: ReliableListener) {
    let mut shutdown = hub.subscribe_shutdown();
    loop {
        // Covers a shutdown signalled before this task subscribed.
        if hub.is_shutting_down() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, addr)) => hub.on_new_connection(conn, addr).await,
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
    info!("Listener stopped");
}

/// The relay server: owns the listener until started, and the hub for the
/// process lifetime.
pub struct RelayServer {
    local_addr: SocketAddr,
    listener: Option<ReliableListener>,
    hub: Arc<Hub>,
}

impl RelayServer {
    /// Binds the listen socket and builds the hub; no connection is
    /// accepted until [`RelayServer::start`].
    pub async fn bind(cfg: RelayConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = ReliableListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let ports = PortAllocator::new(cfg.udp_min_port, cfg.udp_max_port);

        Ok(Self {
            local_addr,
            listener: Some(listener),
            hub: Arc::new(Hub::new(ports)),
        })
    }

    /// Returns the bound address (useful with an ephemeral listen port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop. Precondition: not yet started.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let listener = self.listener.take().context("server already started")?;
        info!(addr = %self.local_addr, "Relay listening");
        tokio::spawn(accept_loop(self.hub.clone(), listener));
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.hub.client_count()
    }

    /// Graceful stop: halt the listener first, then ask a snapshot of the
    /// clients to close. Reader termination is best-effort; readers observe
    /// the stop signal at their next wakeup.
    pub async fn stop(&self) {
        info!("Stopping relay");
        let _ = self.hub.shutdown_tx.send(true);
        for tp in self.hub.clients_snapshot() {
            self.hub.close_transport(&tp);
        }
        time::sleep(Duration::from_millis(100)).await;
    }
}

/// Helper for tests: bind to an ephemeral port on loopback.
pub async fn bind_ephemeral() -> anyhow::Result<(RelayServer, RelayConfig)> {
    let mut cfg = RelayConfig {
        server_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let server = RelayServer::bind(cfg.clone()).await?;
    cfg.server_addr = server.local_addr().to_string();
    Ok((server, cfg))
}
