//! Per-client transport: one reliable channel, at most one datagram
//! channel, and the rider profile, glued to the hub by reader tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::sync::watch;
use tracing::{info, warn};

use relay_shared::net::{DatagramChannel, ReliableReader, ReliableWriter, MAX_DATAGRAM_LEN};
use relay_shared::profile::{RiderProfile, RiderStatus, StatusUpdate, UserUpdate};

use crate::hub::Hub;

/// A connected client.
///
/// The reliable writer is shared between the hub's fan-out and direct
/// replies, so it sits behind an async mutex; the profile only sees short
/// synchronous critical sections.
pub struct Transport {
    id: u64,
    peer: SocketAddr,
    profile: Mutex<RiderProfile>,
    writer: tokio::sync::Mutex<ReliableWriter>,
    datagram: OnceLock<DatagramChannel>,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Transport {
    pub(crate) fn new(id: u64, peer: SocketAddr, writer: ReliableWriter) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            peer,
            profile: Mutex::new(RiderProfile::default()),
            writer: tokio::sync::Mutex::new(writer),
            datagram: OnceLock::new(),
            closed: AtomicBool::new(false),
            stop_tx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn scene_id(&self) -> String {
        self.profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .scene_id
            .clone()
    }

    pub fn profile_json(&self) -> anyhow::Result<String> {
        self.profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_json()
    }

    pub fn apply_user(&self, update: &UserUpdate) {
        self.profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply_user(update);
    }

    pub fn apply_status(&self, update: &StatusUpdate) {
        self.profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply_status(update);
    }

    pub fn status_update(&self) -> RiderStatus {
        self.profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status_update()
    }

    /// Attaches the lazily created datagram channel; false if one exists.
    pub(crate) fn attach_datagram(&self, channel: DatagramChannel) -> bool {
        self.datagram.set(channel).is_ok()
    }

    pub fn has_datagram(&self) -> bool {
        self.datagram.get().is_some()
    }

    /// Sends on the reliable channel. Errors surface to the caller, which
    /// closes this client and no other.
    pub async fn send_reliable(&self, payload: &[u8]) -> anyhow::Result<()> {
        self.writer.lock().await.send(payload).await
    }

    /// Sends on the datagram channel; a no-op while the channel is absent
    /// or its peer address has not been learned.
    pub async fn send_unreliable(&self, payload: &[u8]) {
        if let Some(channel) = self.datagram.get() {
            channel.try_send(payload).await;
        }
    }

    /// Signals both reader tasks to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub(crate) fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Latches the closed flag; true only for the first caller.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Reliable reader loop. Dispatches frames into the hub until the peer
/// closes, an I/O error occurs, or the transport is stopped; all exits
/// funnel through the hub's close path.
pub(crate) async fn run_reliable(hub: Arc<Hub>, tp: Arc<Transport>, mut reader: ReliableReader) {
    let mut stop = tp.subscribe_stop();
    loop {
        // A stop signalled before we subscribed would be missed by the
        // select below.
        if tp.is_closed() {
            break;
        }
        tokio::select! {
            _ = stop.changed() => break,
            frame = reader.recv() => match frame {
                Ok(Some(bytes)) => hub.on_reliable_received(&tp, &bytes).await,
                Ok(None) => {
                    info!(client_id = tp.id(), "connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(client_id = tp.id(), error = %e, "reliable channel error");
                    break;
                }
            }
        }
    }
    hub.close_transport(&tp);
}

/// Datagram reader loop. The channel itself absorbs the discovery probe
/// and datagrams from non-learned sources; everything else fans out.
pub(crate) async fn run_datagram(hub: Arc<Hub>, tp: Arc<Transport>, channel: DatagramChannel) {
    let mut stop = tp.subscribe_stop();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        if tp.is_closed() {
            break;
        }
        tokio::select! {
            _ = stop.changed() => break,
            received = channel.recv(&mut buf) => match received {
                Ok(Some(len)) => hub.on_unreliable_received(&tp, &buf[..len]).await,
                Ok(None) => {}
                // Reset reports ICMP errors from earlier sends; keep reading.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!(client_id = tp.id(), error = %e, "datagram channel error");
                    break;
                }
            }
        }
    }
    hub.close_transport(&tp);
}
