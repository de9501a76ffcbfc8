//! Binary framing protocol spoken after the cover dialog completes.
//!
//! Each frame has a 5-byte header: type(1) + channel_id(2) + payload_len(2),
//! all big-endian, followed by `payload_len` bytes of payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// DATA frame: payload bytes for an open channel.
pub const FRAME_DATA: u8 = 0x01;
/// CONNECT frame: client requests an outbound connection.
pub const FRAME_CONNECT: u8 = 0x02;
/// CONNECT_OK frame: server accepted a CONNECT.
pub const FRAME_CONNECT_OK: u8 = 0x03;
/// CONNECT_FAIL frame: server rejected a CONNECT; payload is error text.
pub const FRAME_CONNECT_FAIL: u8 = 0x04;
/// CLOSE frame: either side tears down a channel.
pub const FRAME_CLOSE: u8 = 0x05;
/// PING frame: round-trip probe.
pub const FRAME_PING: u8 = 0x06;
/// PONG frame: echo of a PING payload.
pub const FRAME_PONG: u8 = 0x07;

/// Fixed header length: type(1) + channel_id(2) + payload_len(2).
pub const HEADER_SIZE: usize = 5;

/// Maximum payload per frame.
pub const MAX_PAYLOAD: usize = 65_535;

/// Channel id reserved for PING/PONG correlation; never allocated to a
/// real channel.
pub const PING_CHANNEL_ID: u16 = 0xFFFF;

/// A single protocol frame.
///
/// The type tag is kept as a raw byte so frames with unknown tags can be
/// read off the stream and ignored by the session engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub channel_id: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a DATA frame.
    pub fn data(channel_id: u16, payload: &[u8]) -> Self {
        Self {
            frame_type: FRAME_DATA,
            channel_id,
            payload: payload.to_vec(),
        }
    }

    /// Create a CONNECT frame; `payload` is an encoded host/port pair.
    pub fn connect(channel_id: u16, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FRAME_CONNECT,
            channel_id,
            payload,
        }
    }

    /// Create a CONNECT_OK frame.
    pub fn connect_ok(channel_id: u16) -> Self {
        Self {
            frame_type: FRAME_CONNECT_OK,
            channel_id,
            payload: Vec::new(),
        }
    }

    /// Create a CONNECT_FAIL frame carrying error text.
    pub fn connect_fail(channel_id: u16, reason: Vec<u8>) -> Self {
        Self {
            frame_type: FRAME_CONNECT_FAIL,
            channel_id,
            payload: reason,
        }
    }

    /// Create a CLOSE frame.
    pub fn close(channel_id: u16) -> Self {
        Self {
            frame_type: FRAME_CLOSE,
            channel_id,
            payload: Vec::new(),
        }
    }

    /// Create a PING frame.
    pub fn ping(channel_id: u16, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FRAME_PING,
            channel_id,
            payload,
        }
    }

    /// Create a PONG frame echoing a PING payload.
    pub fn pong(channel_id: u16, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FRAME_PONG,
            channel_id,
            payload,
        }
    }

    /// Human-readable name for the frame type, for logging.
    pub fn type_name(&self) -> &'static str {
        match self.frame_type {
            FRAME_DATA => "DATA",
            FRAME_CONNECT => "CONNECT",
            FRAME_CONNECT_OK => "CONNECT_OK",
            FRAME_CONNECT_FAIL => "CONNECT_FAIL",
            FRAME_CLOSE => "CLOSE",
            FRAME_PING => "PING",
            FRAME_PONG => "PONG",
            _ => "UNKNOWN",
        }
    }
}

/// Encode a host/port pair for a CONNECT payload:
/// host_len(1) + host + port(2).
pub fn encode_host_port(host: &str, port: u16) -> Result<Vec<u8>> {
    let host_bytes = host.as_bytes();
    if host_bytes.len() > 255 {
        return Err(Error::protocol(format!(
            "host too long: {} bytes",
            host_bytes.len()
        )));
    }
    let mut buf = Vec::with_capacity(1 + host_bytes.len() + 2);
    buf.push(host_bytes.len() as u8);
    buf.extend_from_slice(host_bytes);
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(buf)
}

/// Decode a CONNECT payload into (host, port).
pub fn decode_host_port(payload: &[u8]) -> Result<(String, u16)> {
    if payload.len() < 4 {
        return Err(Error::protocol("connect payload too short"));
    }
    let host_len = payload[0] as usize;
    if payload.len() < 1 + host_len + 2 {
        return Err(Error::protocol("connect payload truncated"));
    }
    let host = String::from_utf8_lossy(&payload[1..1 + host_len]).into_owned();
    let port = u16::from_be_bytes([payload[1 + host_len], payload[2 + host_len]]);
    Ok((host, port))
}

/// Thread-safe frame writer.
///
/// An internal async mutex serializes concurrent writers so a frame's
/// header and payload never interleave with another frame's bytes.
pub struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writer with mutex-protected frame writing.
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// Write a single frame atomically.
    pub async fn write_frame(&self, frame: &Frame) -> Result<()> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(Error::protocol(format!(
                "payload too large: {} bytes",
                frame.payload.len()
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        header[0] = frame.frame_type;
        header[1..3].copy_from_slice(&frame.channel_id.to_be_bytes());
        header[3..5].copy_from_slice(&(frame.payload.len() as u16).to_be_bytes());

        let mut w = self.inner.lock().await;
        w.write_all(&header).await?;
        if !frame.payload.is_empty() {
            w.write_all(&frame.payload).await?;
        }
        w.flush().await?;
        Ok(())
    }
}

/// Read a single frame from the stream.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary. EOF inside a
/// frame is a protocol error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::protocol("eof inside frame header"));
        }
        filled += n;
    }

    let frame_type = header[0];
    let channel_id = u16::from_be_bytes([header[1], header[2]]);
    let payload_len = u16::from_be_bytes([header[3], header[4]]) as usize;

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::protocol("eof inside frame payload")
            } else {
                Error::Io(e)
            }
        })?;
    }

    Ok(Some(Frame {
        frame_type,
        channel_id,
        payload,
    }))
}
