//! SOCKS5 ingress (RFC 1928, with RFC 1929 username/password).
//!
//! Only CMD=CONNECT is served; every accepted request becomes one
//! tunnel channel. The data plane is the shared pump in
//! [`crate::ingress`].

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::SocksEntry;
use crate::error::{Error, Result};
use crate::tunnel::Tunnel;

const SOCKS_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Deadline covering method negotiation and request parsing. The data
/// plane afterwards is not deadline-bound.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// A SOCKS5 listener feeding the tunnel.
pub struct Socks5Server {
    listen: String,
    username: String,
    password: String,
    tunnel: Arc<Tunnel>,
}

impl Socks5Server {
    pub fn new(entry: &SocksEntry, tunnel: Arc<Tunnel>) -> Self {
        Self {
            listen: entry.listen.clone(),
            username: entry.username.clone(),
            password: entry.password.clone(),
            tunnel,
        }
    }

    fn has_auth(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Accept SOCKS5 clients until the task is stopped.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen).await?;
        let auth = if self.has_auth() {
            format!("user/pass ({})", self.username)
        } else {
            "none".to_string()
        };
        tracing::info!("SOCKS5 proxy on {} (auth: {auth})", self.listen);

        let this = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = Arc::clone(&this);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_client(stream).await {
                            tracing::debug!("SOCKS5 client {peer}: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("SOCKS5 accept error: {e}");
                }
            }
        }
    }

    async fn handle_client(&self, mut stream: TcpStream) -> Result<()> {
        if !self.tunnel.is_connected() {
            return Ok(());
        }

        let dest = match timeout(NEGOTIATION_TIMEOUT, self.negotiate(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout("socks5 negotiation")),
        };
        let Some((host, port)) = dest else {
            // Refusal reply already sent.
            return Ok(());
        };

        tracing::debug!("SOCKS5 CONNECT {host}:{port}");

        let channel_id = match self.tunnel.open(&host, port).await {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!("SOCKS5 open {host}:{port} failed: {e}");
                send_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
                return Ok(());
            }
        };

        // Bind the channel before replying so no inbound DATA can race
        // past an unregistered id.
        let from_tunnel = self.tunnel.register(channel_id);
        send_reply(&mut stream, REP_SUCCESS).await?;

        crate::ingress::pump_channel(&self.tunnel, channel_id, stream, from_tunnel).await;
        Ok(())
    }

    /// Run method selection, optional credential check, and request
    /// parsing. `Ok(None)` means the client was refused and a reply
    /// (where the protocol defines one) has been sent.
    async fn negotiate<S>(&self, stream: &mut S) -> Result<Option<(String, u16)>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Ok(None);
        }
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        if self.has_auth() {
            if !methods.contains(&AUTH_PASSWORD) {
                stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
                return Ok(None);
            }
            stream.write_all(&[SOCKS_VERSION, AUTH_PASSWORD]).await?;
            if !self.check_credentials(stream).await? {
                return Ok(None);
            }
        } else {
            stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;
        }

        let mut req = [0u8; 4];
        stream.read_exact(&mut req).await?;
        if req[0] != SOCKS_VERSION || req[1] != CMD_CONNECT {
            send_reply(stream, REP_CMD_NOT_SUPPORTED).await?;
            return Ok(None);
        }

        let host = match req[3] {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                Ipv4Addr::from(addr).to_string()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                String::from_utf8_lossy(&domain).into_owned()
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                Ipv6Addr::from(addr).to_string()
            }
            _ => {
                send_reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
                return Ok(None);
            }
        };

        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;
        Ok(Some((host, u16::from_be_bytes(port))))
    }

    /// RFC 1929 username/password subnegotiation.
    async fn check_credentials<S>(&self, stream: &mut S) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        if byte[0] != 0x01 {
            return Ok(false);
        }

        stream.read_exact(&mut byte).await?;
        let mut uname = vec![0u8; byte[0] as usize];
        stream.read_exact(&mut uname).await?;

        stream.read_exact(&mut byte).await?;
        let mut passwd = vec![0u8; byte[0] as usize];
        stream.read_exact(&mut passwd).await?;

        if uname != self.username.as_bytes() || passwd != self.password.as_bytes() {
            stream.write_all(&[0x01, 0x01]).await?;
            return Ok(false);
        }
        stream.write_all(&[0x01, 0x00]).await?;
        Ok(true)
    }
}

/// Send a reply with a zero BND.ADDR (0.0.0.0:0).
async fn send_reply<S>(stream: &mut S, rep: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}
