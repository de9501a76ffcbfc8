//! Responder-side session engine.
//!
//! The accept loop drives the cover handshake, gates the peer against
//! the principal's source allow-list, then hands the TLS stream to a
//! per-connection session. The session's read-dispatch task routes
//! frames; each accepted CONNECT gets its own dial task and, on
//! success, a pump task that owns the destination socket.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::error::Result;
use crate::handshake;
use crate::proto::{self, read_frame, Frame, FrameWriter};
use crate::tunnel::{CHANNEL_QUEUE, DIAL_TIMEOUT, READ_BUF_SIZE};

/// CONNECT_FAIL reason text is capped at this many bytes.
const MAX_FAIL_REASON: usize = 100;

type SharedWriter = Arc<FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>>;
type ChannelTable = Arc<Mutex<HashMap<u16, ServerChannel>>>;

/// The tunnel server: cover listener plus per-connection sessions.
pub struct Server {
    config: Arc<Config>,
    acceptor: TlsAcceptor,
}

impl Server {
    pub fn new(config: Arc<Config>, acceptor: TlsAcceptor) -> Self {
        Self { config, acceptor }
    }

    /// Accept connections forever.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.listen).await?;
        tracing::info!("listening on {}", self.config.server.listen);
        tracing::info!("cover hostname: {}", self.config.server.hostname);
        tracing::info!("principals loaded: {}", self.config.server.users.len());

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let config = Arc::clone(&self.config);
                    let acceptor = self.acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(config, acceptor, stream, peer).await {
                            tracing::debug!("connection from {peer} ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                }
            }
        }
    }
}

async fn handle_connection(
    config: Arc<Config>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    tracing::debug!("connection from {peer}");

    let principals = config.principals();
    let (username, tls) =
        handshake::server_handshake(stream, &config.server.hostname, &acceptor, &principals)
            .await?;

    let user = config.find_user(&username);
    if let Some(user) = user {
        if !source_allowed(peer.ip(), &user.whitelist) {
            tracing::warn!("[{username}] source {peer} not in whitelist, dropping");
            return Ok(());
        }
    }
    let log_traffic = user.map(|u| u.logging).unwrap_or(true);

    tracing::info!("[{username}] authenticated from {peer}, entering binary mode");
    serve_session(tls, &username, log_traffic).await;
    tracing::info!("[{username}] session ended from {peer}");
    Ok(())
}

/// Check a source address against a principal's allow-list: CIDR
/// prefixes or singleton IPs; `0.0.0.0/0` and `::/0` match everything.
/// An empty list allows everything.
pub fn source_allowed(ip: IpAddr, whitelist: &[String]) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    for entry in whitelist {
        if entry == "0.0.0.0/0" || entry == "::/0" {
            return true;
        }
        if let Ok(net) = entry.parse::<IpNet>() {
            if net.contains(&ip) {
                return true;
            }
        } else if let Ok(single) = entry.parse::<IpAddr>() {
            if single == ip {
                return true;
            }
        }
    }
    false
}

/// Run one authenticated session over its (post-TLS) transport until
/// the transport ends, then drain every channel.
///
/// Exposed over a generic stream because the engine's contract is the
/// plaintext byte stream inside the TLS envelope.
pub async fn serve_session<S>(stream: S, username: &str, log_traffic: bool)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
    let writer: SharedWriter = Arc::new(FrameWriter::new(
        Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>
    ));

    let session = Session {
        username: username.to_string(),
        log_traffic,
        writer,
        channels: Arc::new(Mutex::new(HashMap::new())),
    };

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if let Err(e) = session.handle_frame(frame).await {
                    tracing::warn!("[{}] fatal frame error: {e}", session.username);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("[{}] read error: {e}", session.username);
                break;
            }
        }
    }

    session.teardown();
}

struct ServerChannel {
    data_tx: mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

struct Session {
    username: String,
    log_traffic: bool,
    writer: SharedWriter,
    channels: ChannelTable,
}

impl Session {
    async fn handle_frame(&self, frame: Frame) -> Result<()> {
        match frame.frame_type {
            proto::FRAME_CONNECT => self.handle_connect(frame)?,
            proto::FRAME_DATA => self.handle_data(frame).await,
            proto::FRAME_CLOSE => close_channel(&self.channels, frame.channel_id),
            proto::FRAME_PING => {
                self.writer
                    .write_frame(&Frame::pong(frame.channel_id, frame.payload))
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Dial the requested destination in its own task so a slow dial
    /// cannot stall dispatch for other channels.
    fn handle_connect(&self, frame: Frame) -> Result<()> {
        // A malformed CONNECT payload is fatal to the session.
        let (host, port) = proto::decode_host_port(&frame.payload)?;

        let id = frame.channel_id;
        if self.log_traffic {
            tracing::info!("[{}] CONNECT ch={id} -> {host}:{port}", self.username);
        }

        let writer = Arc::clone(&self.writer);
        let channels = Arc::clone(&self.channels);
        let username = self.username.clone();
        let log_traffic = self.log_traffic;

        tokio::spawn(async move {
            let dest = match timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port))).await
            {
                Ok(Ok(dest)) => dest,
                Ok(Err(e)) => {
                    if log_traffic {
                        tracing::info!("[{username}] connect failed ch={id}: {e}");
                    }
                    let err_string = e.to_string();
                    let reason = truncate_utf8(&err_string, MAX_FAIL_REASON);
                    let _ = writer
                        .write_frame(&Frame::connect_fail(id, reason.as_bytes().to_vec()))
                        .await;
                    return;
                }
                Err(_) => {
                    if log_traffic {
                        tracing::info!("[{username}] connect timed out ch={id}");
                    }
                    let _ = writer
                        .write_frame(&Frame::connect_fail(id, b"dial timed out".to_vec()))
                        .await;
                    return;
                }
            };

            let (data_tx, data_rx) = mpsc::channel(CHANNEL_QUEUE);
            let closed = Arc::new(AtomicBool::new(false));
            channels.lock().insert(
                id,
                ServerChannel {
                    data_tx,
                    closed: Arc::clone(&closed),
                },
            );

            if writer.write_frame(&Frame::connect_ok(id)).await.is_err() {
                channels.lock().remove(&id);
                return;
            }
            if log_traffic {
                tracing::debug!("[{username}] connected ch={id}");
            }

            channel_pump(id, dest, data_rx, writer, closed, channels).await;
        });

        Ok(())
    }

    async fn handle_data(&self, frame: Frame) {
        let entry = {
            let channels = self.channels.lock();
            channels
                .get(&frame.channel_id)
                .map(|c| (c.data_tx.clone(), Arc::clone(&c.closed)))
        };
        let Some((tx, closed)) = entry else {
            return;
        };
        if closed.load(Ordering::SeqCst) {
            return;
        }
        if tx.send(frame.payload).await.is_err() {
            close_channel(&self.channels, frame.channel_id);
        }
    }

    fn teardown(&self) {
        let ids: Vec<u16> = self.channels.lock().keys().copied().collect();
        for id in ids {
            close_channel(&self.channels, id);
        }
    }
}

/// Locally close a channel: set its closed flag and drop it from the
/// table. Dropping the queue sender wakes the pump, which drops the
/// destination socket. Idempotent.
fn close_channel(channels: &ChannelTable, id: u16) {
    if let Some(ch) = channels.lock().remove(&id) {
        ch.closed.store(true, Ordering::SeqCst);
    }
}

/// Pump bytes between the destination socket and the session.
///
/// Owns the socket; exits on destination EOF/error, session write
/// failure, or the channel being dropped from the table. If the exit
/// was not caused by a local close, announces it with a CLOSE frame.
async fn channel_pump(
    id: u16,
    dest: TcpStream,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    writer: SharedWriter,
    closed: Arc<AtomicBool>,
    channels: ChannelTable,
) {
    let (mut dest_rd, mut dest_wr) = dest.into_split();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        tokio::select! {
            res = dest_rd.read(&mut buf) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.write_frame(&Frame::data(id, &buf[..n])).await.is_err() {
                        break;
                    }
                }
            },
            msg = data_rx.recv() => match msg {
                Some(data) => {
                    if dest_wr.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if !closed.swap(true, Ordering::SeqCst) {
        let _ = writer.write_frame(&Frame::close(id)).await;
        channels.lock().remove(&id);
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
