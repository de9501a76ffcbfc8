//! Initiator-side session engine.
//!
//! One [`Tunnel`] exists per live session. Ingress adapters drive it
//! through a small surface: [`Tunnel::open`] to request a channel,
//! [`Tunnel::register`] to bind the local socket's inbound queue,
//! [`Tunnel::send_data`] for the uplink, and the close pair
//! ([`Tunnel::close_remote`], then [`Tunnel::close_local`]). A single
//! receiver task dispatches inbound frames to channels and waiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::proto::{self, read_frame, Frame, FrameWriter, PING_CHANNEL_ID};
use crate::tunnel::{CHANNEL_QUEUE, OPEN_TIMEOUT, PING_TIMEOUT};

/// Boxed read half of the session transport, consumed by
/// [`Tunnel::run_receiver`].
pub type TunnelReader = Box<dyn AsyncRead + Send + Unpin>;

type TunnelWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Outcome delivered to a single-shot waiter.
enum Reply {
    Ok,
    Fail(String),
}

struct ChannelHandle {
    data_tx: mpsc::Sender<Vec<u8>>,
}

/// Initiator session state shared between ingress adapters and the
/// receiver task.
pub struct Tunnel {
    writer: TunnelWriter,
    connected: AtomicBool,
    channels: Mutex<HashMap<u16, ChannelHandle>>,
    pending: Mutex<HashMap<u16, oneshot::Sender<Reply>>>,
    next_id: AtomicU32,
}

impl Tunnel {
    /// Wrap an established (handshaken) session transport.
    ///
    /// Returns the shared tunnel handle and the read half to hand to
    /// [`Tunnel::run_receiver`].
    pub fn new<S>(stream: S) -> (Arc<Self>, TunnelReader)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let tunnel = Arc::new(Self {
            writer: FrameWriter::new(Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>),
            connected: AtomicBool::new(true),
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        });
        (tunnel, Box::new(reader))
    }

    /// Whether the session transport is still up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Allocate a fresh channel id: never 0 or the ping id, and never
    /// an id still present in the channel or pending tables.
    fn allocate_channel_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u16;
            if id == 0 || id == PING_CHANNEL_ID {
                continue;
            }
            if self.channels.lock().contains_key(&id) || self.pending.lock().contains_key(&id) {
                continue;
            }
            return id;
        }
    }

    /// Request a new channel to `host:port` through the tunnel.
    ///
    /// Blocks up to 30 seconds for the responder's answer. The waiter
    /// slot is cleaned up on every path.
    pub async fn open(&self, host: &str, port: u16) -> Result<u16> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let payload = proto::encode_host_port(host, port)?;
        let id = self.allocate_channel_id();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.writer.write_frame(&Frame::connect(id, payload)).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match timeout(OPEN_TIMEOUT, rx).await {
            Ok(Ok(Reply::Ok)) => Ok(id),
            Ok(Ok(Reply::Fail(reason))) => Err(Error::ChannelOpen(reason)),
            // Waiter dropped: the session tore down underneath us.
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Timeout("channel open"))
            }
        }
    }

    /// Bind a successfully opened channel. Inbound DATA payloads for
    /// `channel_id` arrive on the returned receiver; the receiver
    /// closing (queue dropped) signals local close to the pump.
    pub fn register(&self, channel_id: u16) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE);
        self.channels
            .lock()
            .insert(channel_id, ChannelHandle { data_tx: tx });
        rx
    }

    /// Send bytes on an open channel.
    pub async fn send_data(&self, channel_id: u16, data: &[u8]) -> Result<()> {
        self.writer.write_frame(&Frame::data(channel_id, data)).await
    }

    /// Tell the responder to tear down a channel. Errors are ignored:
    /// if the transport is gone the channel is dead anyway.
    pub async fn close_remote(&self, channel_id: u16) {
        let _ = self.writer.write_frame(&Frame::close(channel_id)).await;
    }

    /// Drop a channel from the local table, closing its inbound queue.
    pub fn close_local(&self, channel_id: u16) {
        self.channels.lock().remove(&channel_id);
    }

    /// Round-trip probe over the reserved ping channel id.
    pub async fn ping(&self) -> Result<Duration> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(PING_CHANNEL_ID, tx);

        let payload = monotonic_ns().to_be_bytes().to_vec();
        let start = Instant::now();
        if let Err(e) = self
            .writer
            .write_frame(&Frame::ping(PING_CHANNEL_ID, payload))
            .await
        {
            self.pending.lock().remove(&PING_CHANNEL_ID);
            return Err(e);
        }

        match timeout(PING_TIMEOUT, rx).await {
            Ok(Ok(_)) => Ok(start.elapsed()),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.pending.lock().remove(&PING_CHANNEL_ID);
                Err(Error::Timeout("ping"))
            }
        }
    }

    /// Read and dispatch frames until the transport ends. Marks the
    /// session disconnected on return so the supervisor can rebuild.
    pub async fn run_receiver(self: Arc<Self>, mut reader: TunnelReader) {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => self.dispatch(frame).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("receiver error: {e}");
                    break;
                }
            }
        }
        self.disconnect();
    }

    async fn dispatch(&self, frame: Frame) {
        match frame.frame_type {
            proto::FRAME_CONNECT_OK => self.signal_waiter(frame.channel_id, Reply::Ok),
            proto::FRAME_CONNECT_FAIL => self.signal_waiter(
                frame.channel_id,
                Reply::Fail(String::from_utf8_lossy(&frame.payload).into_owned()),
            ),
            proto::FRAME_PONG => self.signal_waiter(frame.channel_id, Reply::Ok),
            proto::FRAME_DATA => {
                let tx = self
                    .channels
                    .lock()
                    .get(&frame.channel_id)
                    .map(|c| c.data_tx.clone());
                if let Some(tx) = tx {
                    if tx.send(frame.payload).await.is_err() {
                        self.close_local(frame.channel_id);
                    }
                }
            }
            proto::FRAME_CLOSE => self.close_local(frame.channel_id),
            _ => {}
        }
    }

    fn signal_waiter(&self, channel_id: u16, reply: Reply) {
        if let Some(tx) = self.pending.lock().remove(&channel_id) {
            let _ = tx.send(reply);
        }
    }

    /// Tear the session down: drop every channel queue and waiter.
    /// Blocked `open`/`ping` callers observe the dropped waiter and
    /// fail with `NotConnected`.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.channels.lock().clear();
        self.pending.lock().clear();
    }
}

/// Nanoseconds from a process-local monotonic base; ping payload only,
/// never parsed by the peer.
fn monotonic_ns() -> u64 {
    static BASE: OnceLock<Instant> = OnceLock::new();
    BASE.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::FRAME_PING;

    fn tunnel() -> (Arc<Tunnel>, TunnelReader, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (tunnel, reader) = Tunnel::new(local);
        (tunnel, reader, remote)
    }

    #[tokio::test]
    async fn test_allocator_skips_reserved_ids() {
        let (tunnel, _reader, _remote) = tunnel();

        tunnel.next_id.store(0, Ordering::SeqCst);
        assert_eq!(tunnel.allocate_channel_id(), 1);

        tunnel.next_id.store(PING_CHANNEL_ID as u32, Ordering::SeqCst);
        let id = tunnel.allocate_channel_id();
        assert_ne!(id, PING_CHANNEL_ID);
        assert_ne!(id, 0);
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn test_allocator_skips_live_ids() {
        let (tunnel, _reader, _remote) = tunnel();

        let _rx = tunnel.register(5);
        tunnel.next_id.store(5, Ordering::SeqCst);
        assert_eq!(tunnel.allocate_channel_id(), 6);

        let (tx, _rx2) = oneshot::channel();
        tunnel.pending.lock().insert(7, tx);
        tunnel.next_id.store(7, Ordering::SeqCst);
        assert_eq!(tunnel.allocate_channel_id(), 8);
    }

    #[tokio::test]
    async fn test_allocator_ids_distinct() {
        let (tunnel, _reader, _remote) = tunnel();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = tunnel.allocate_channel_id();
            assert_ne!(id, 0);
            assert_ne!(id, PING_CHANNEL_ID);
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn test_data_dispatch_and_close() {
        let (tunnel, reader, remote) = tunnel();
        let receiver = tokio::spawn(Arc::clone(&tunnel).run_receiver(reader));

        let mut rx = tunnel.register(3);
        let peer = FrameWriter::new(remote);

        peer.write_frame(&Frame::data(3, b"payload")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"payload");

        // DATA for an unknown channel is ignored.
        peer.write_frame(&Frame::data(9, b"stray")).await.unwrap();

        // CLOSE removes the channel; the queue ends.
        peer.write_frame(&Frame::close(3)).await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(!tunnel.channels.lock().contains_key(&3));

        drop(peer);
        receiver.await.unwrap();
        assert!(!tunnel.is_connected());
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (tunnel, reader, remote) = tunnel();
        let receiver = tokio::spawn(Arc::clone(&tunnel).run_receiver(reader));

        // Echo PING back as PONG, byte-for-byte, like the responder does.
        let (mut peer_rd, peer_wr) = tokio::io::split(remote);
        let peer_writer = FrameWriter::new(peer_wr);
        let echo = tokio::spawn(async move {
            let frame = read_frame(&mut peer_rd).await.unwrap().unwrap();
            assert_eq!(frame.frame_type, FRAME_PING);
            assert_eq!(frame.channel_id, PING_CHANNEL_ID);
            assert_eq!(frame.payload.len(), 8);
            peer_writer
                .write_frame(&Frame::pong(frame.channel_id, frame.payload))
                .await
                .unwrap();
            peer_writer
        });

        let rtt = tunnel.ping().await.unwrap();
        assert!(rtt < Duration::from_secs(1));
        assert!(tunnel.pending.lock().is_empty());

        drop(echo.await.unwrap());
        receiver.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_reports_reason() {
        let (tunnel, reader, remote) = tunnel();
        let receiver = tokio::spawn(Arc::clone(&tunnel).run_receiver(reader));

        let (mut peer_rd, peer_wr) = tokio::io::split(remote);
        let peer_writer = FrameWriter::new(peer_wr);
        let responder = tokio::spawn(async move {
            let frame = read_frame(&mut peer_rd).await.unwrap().unwrap();
            let (host, port) = proto::decode_host_port(&frame.payload).unwrap();
            assert_eq!(host, "unreachable.internal");
            assert_eq!(port, 81);
            peer_writer
                .write_frame(&Frame::connect_fail(
                    frame.channel_id,
                    b"connection refused".to_vec(),
                ))
                .await
                .unwrap();
            peer_writer
        });

        let err = tunnel.open("unreachable.internal", 81).await.unwrap_err();
        match err {
            Error::ChannelOpen(reason) => assert_eq!(reason, "connection refused"),
            other => panic!("expected ChannelOpen, got: {other}"),
        }
        assert!(tunnel.pending.lock().is_empty());
        assert!(tunnel.channels.lock().is_empty());

        drop(responder.await.unwrap());
        receiver.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_fails_blocked_open() {
        let (tunnel, reader, _remote) = tunnel();
        let receiver = tokio::spawn(Arc::clone(&tunnel).run_receiver(reader));

        let opener = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.open("slow.internal", 80).await })
        };

        // Give the CONNECT a moment to go out, then tear down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tunnel.disconnect();

        let err = opener.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        drop(tunnel);
        receiver.abort();
    }
}
