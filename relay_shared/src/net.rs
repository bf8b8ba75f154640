//! Networking primitives.
//!
//! Goals:
//! - Provide the framed reliable (TCP) channel and the unreliable (UDP)
//!   channel shared by client and server.
//! - Keep framing explicit: 4-byte little-endian length header, 1 MiB cap.
//! - Relayed payloads stay opaque bytes; only the control envelope above
//!   this layer is JSON.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time;
use tracing::{debug, trace};

/// Length header size of a reliable frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a reliable frame may carry. Oversize sends are truncated.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Largest datagram payload, sized to fit a common MTU.
pub const MAX_DATAGRAM_LEN: usize = 1472;

/// First datagram a client sends so the server can learn its UDP source
/// address. Absorbed by the receiver, never relayed.
pub const DISCOVERY_PROBE: &[u8] = b"010011000111";

/// Encodes one reliable frame: little-endian length header plus payload.
///
/// Empty payloads are rejected; payloads over [`MAX_FRAME_LEN`] are
/// truncated and sent at the shorter length.
pub fn encode_frame(payload: &[u8]) -> anyhow::Result<BytesMut> {
    anyhow::ensure!(!payload.is_empty(), "refusing to send an empty frame");

    let payload = if payload.len() > MAX_FRAME_LEN {
        debug!(len = payload.len(), "frame over limit, truncating");
        &payload[..MAX_FRAME_LEN]
    } else {
        payload
    };

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Reads one frame. `Ok(None)` means the peer closed cleanly at a frame
/// boundary; EOF mid-payload and over-limit headers are errors.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("read frame header"),
    }

    let len = u32::from_le_bytes(header) as usize;
    anyhow::ensure!(len > 0 && len <= MAX_FRAME_LEN, "bad frame length {len}");

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("read frame payload")?;
    Ok(Some(payload))
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let buf = encode_frame(payload)?;
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    /// Receives one frame; `Ok(None)` means the peer closed.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        read_frame(&mut self.stream).await
    }

    /// Receives one frame within the given deadline. `Ok(None)` is a
    /// timeout; a peer close is reported as an error.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        match time::timeout(timeout, self.recv()).await {
            Ok(Ok(Some(frame))) => Ok(Some(frame)),
            Ok(Ok(None)) => anyhow::bail!("connection closed by peer"),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Splits into independently owned halves so one task can read while
    /// another writes.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (read, write) = self.stream.into_split();
        (ReliableReader { half: read }, ReliableWriter { half: write })
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

/// Read half of a split [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableReader {
    half: OwnedReadHalf,
}

impl ReliableReader {
    /// Receives one frame; `Ok(None)` means the peer closed.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        read_frame(&mut self.half).await
    }
}

/// Write half of a split [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    half: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let buf = encode_frame(payload)?;
        self.half.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Server-side UDP endpoint with address learning.
///
/// The remote address is unknown at construction; it is memoized from the
/// first inbound datagram, after which datagrams from any other source are
/// dropped. Cloning shares the socket and the learned peer.
#[derive(Debug, Clone)]
pub struct DatagramChannel {
    socket: Arc<UdpSocket>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
}

impl DatagramChannel {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            peer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The learned remote address, if any.
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn learn(&self, addr: SocketAddr) -> bool {
        let mut peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        if peer.is_none() {
            *peer = Some(addr);
            return true;
        }
        false
    }

    /// Receives one datagram into `buf`. `Ok(None)` means the datagram was
    /// absorbed: a discovery probe, or traffic from a source other than the
    /// learned peer.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
        let (len, addr) = self.socket.recv_from(buf).await?;

        if self.learn(addr) {
            debug!(peer = %addr, "udp peer address learned");
        } else if self.peer() != Some(addr) {
            trace!(source = %addr, "datagram from unknown source, dropping");
            return Ok(None);
        }

        if &buf[..len] == DISCOVERY_PROBE {
            trace!(peer = %addr, "discovery probe absorbed");
            return Ok(None);
        }

        Ok(Some(len))
    }

    /// Sends a datagram to the learned peer; silently drops the payload
    /// until an address has been learned. Oversize payloads are truncated.
    pub async fn try_send(&self, payload: &[u8]) {
        let Some(peer) = self.peer() else {
            debug!("udp peer address not learned yet, discarding send");
            return;
        };
        let payload = if payload.len() > MAX_DATAGRAM_LEN {
            &payload[..MAX_DATAGRAM_LEN]
        } else {
            payload
        };
        if let Err(e) = self.socket.send_to(payload, peer).await {
            debug!(peer = %peer, error = %e, "udp send failed, dropping");
        }
    }
}

/// Client-side unreliable channel over a connected UDP socket.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    /// Sends the discovery probe so the server can learn our source address.
    pub async fn send_probe(&self) -> anyhow::Result<()> {
        self.socket
            .send(DISCOVERY_PROBE)
            .await
            .context("udp probe send")?;
        Ok(())
    }

    pub async fn send(&self, payload: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(!payload.is_empty(), "refusing to send an empty datagram");
        let payload = if payload.len() > MAX_DATAGRAM_LEN {
            debug!(len = payload.len(), "datagram over limit, truncating");
            &payload[..MAX_DATAGRAM_LEN]
        } else {
            payload
        };
        self.socket.send(payload).await.context("udp send")?;
        Ok(())
    }

    /// Receives a datagram within the given deadline; `Ok(None)` on timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_is_little_endian() {
        let buf = encode_frame(b"ride").unwrap();
        assert_eq!(&buf[..FRAME_HEADER_LEN], &[4, 0, 0, 0]);
        assert_eq!(&buf[FRAME_HEADER_LEN..], b"ride");
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert!(encode_frame(b"").is_err());
    }

    #[test]
    fn oversize_frame_is_truncated() {
        let exact = vec![7u8; MAX_FRAME_LEN];
        let buf = encode_frame(&exact).unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_LEN + MAX_FRAME_LEN);

        let over = vec![7u8; MAX_FRAME_LEN + 1];
        let buf = encode_frame(&over).unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_LEN + MAX_FRAME_LEN);
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, MAX_FRAME_LEN);
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let buf = encode_frame(b"status update").unwrap();
        let mut slice: &[u8] = &buf;
        let frame = read_frame(&mut slice).await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"status update"[..]));
    }

    #[tokio::test]
    async fn eof_at_frame_boundary_is_clean_close() {
        let mut slice: &[u8] = &[];
        assert!(read_frame(&mut slice).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_payload_is_an_error() {
        let mut buf = encode_frame(b"cut short").unwrap();
        buf.truncate(buf.len() - 2);
        let mut slice: &[u8] = &buf;
        assert!(read_frame(&mut slice).await.is_err());
    }

    #[tokio::test]
    async fn over_limit_header_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRAME_LEN + 1) as u32);
        buf.extend_from_slice(&[0u8; 16]);
        let mut slice: &[u8] = &buf;
        assert!(read_frame(&mut slice).await.is_err());
    }

    #[tokio::test]
    async fn datagram_channel_learns_and_filters() -> anyhow::Result<()> {
        let server = DatagramChannel::new(UdpSocket::bind("127.0.0.1:0").await?);
        let server_addr = server.local_addr()?;

        let bind: SocketAddr = "127.0.0.1:0".parse()?;
        let first = UnreliableConn::connect(bind, server_addr).await?;
        let second = UnreliableConn::connect(bind, server_addr).await?;

        first.send_probe().await?;
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        assert_eq!(server.recv(&mut buf).await?, None);
        assert_eq!(server.peer(), Some(first.local_addr()?));

        // A different source is dropped once the peer is learned.
        second.send(b"intruder").await?;
        assert_eq!(server.recv(&mut buf).await?, None);

        first.send(b"pos:42").await?;
        let len = server.recv(&mut buf).await?.expect("expected app data");
        assert_eq!(&buf[..len], b"pos:42");
        Ok(())
    }

    #[tokio::test]
    async fn oversize_datagram_is_truncated() -> anyhow::Result<()> {
        let server = DatagramChannel::new(UdpSocket::bind("127.0.0.1:0").await?);
        let server_addr = server.local_addr()?;

        let bind: SocketAddr = "127.0.0.1:0".parse()?;
        let client = UnreliableConn::connect(bind, server_addr).await?;

        client.send_probe().await?;
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 8];
        assert_eq!(server.recv(&mut buf).await?, None);

        client.send(&vec![9u8; MAX_DATAGRAM_LEN + 1]).await?;
        let len = server.recv(&mut buf).await?.expect("expected app data");
        assert_eq!(len, MAX_DATAGRAM_LEN);

        // Server -> client truncation on the learned return path.
        server.try_send(&vec![3u8; MAX_DATAGRAM_LEN + 100]).await;
        let back = client
            .recv_timeout(Duration::from_secs(1))
            .await?
            .expect("expected reply datagram");
        assert_eq!(back.len(), MAX_DATAGRAM_LEN);
        Ok(())
    }
}
