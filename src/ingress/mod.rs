//! Ingress adapters: local listeners that feed the session engine.
//!
//! Adapters only produce channel-open requests and byte streams; all
//! tunnel semantics live in [`crate::tunnel`]. Each accepted local
//! socket gets a pump that moves bytes both ways until either side
//! ends, then closes the channel remote-first.

pub mod forward;
pub mod socks5;

pub use forward::Forwarder;
pub use socks5::Socks5Server;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::tunnel::{Tunnel, READ_BUF_SIZE};

/// Pump bytes between a local socket and an open, registered channel.
///
/// Exits on local EOF/error, tunnel write failure, or the channel's
/// inbound queue ending (remote CLOSE or session teardown). Always
/// issues remote-close then local-close on the way out.
pub(crate) async fn pump_channel(
    tunnel: &Tunnel,
    channel_id: u16,
    stream: TcpStream,
    mut from_tunnel: mpsc::Receiver<Vec<u8>>,
) {
    let (mut local_rd, mut local_wr) = stream.into_split();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        tokio::select! {
            res = local_rd.read(&mut buf) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tunnel.send_data(channel_id, &buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            msg = from_tunnel.recv() => match msg {
                Some(data) => {
                    if local_wr.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    tunnel.close_remote(channel_id).await;
    tunnel.close_local(channel_id);
}
