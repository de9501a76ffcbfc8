//! Static port-forward ingress.
//!
//! TCP rules behave like the SOCKS5 data plane with a fixed
//! destination. UDP rules are single-shot: each datagram opens a
//! channel, carries one DATA frame, and closes. There is no reply path.

use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};

use crate::config::ForwardEntry;
use crate::error::{Error, Result};
use crate::proto::MAX_PAYLOAD;
use crate::tunnel::Tunnel;

/// Transport of a forward rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardProto {
    Tcp,
    Udp,
}

/// One forward rule bound to a live tunnel.
pub struct Forwarder {
    listen: String,
    host: String,
    port: u16,
    protocol: ForwardProto,
    tunnel: Arc<Tunnel>,
}

impl Forwarder {
    /// Build a forwarder from a config rule, resolving the destination
    /// address shape up front.
    pub fn from_entry(entry: &ForwardEntry, tunnel: Arc<Tunnel>) -> Result<Self> {
        let (host, port) = split_host_port(&entry.to)?;
        let protocol = match entry.protocol.as_str() {
            "udp" => ForwardProto::Udp,
            _ => ForwardProto::Tcp,
        };
        Ok(Self {
            listen: entry.listen.clone(),
            host,
            port,
            protocol,
            tunnel,
        })
    }

    /// Serve the rule until the task is stopped.
    pub async fn run(self) -> Result<()> {
        match self.protocol {
            ForwardProto::Tcp => self.run_tcp().await,
            ForwardProto::Udp => self.run_udp().await,
        }
    }

    async fn run_tcp(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen).await?;
        tracing::info!("forward {} -> {}:{} (tcp)", self.listen, self.host, self.port);

        let this = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = Arc::clone(&this);
                    tokio::spawn(async move {
                        if !this.tunnel.is_connected() {
                            return;
                        }
                        match this.tunnel.open(&this.host, this.port).await {
                            Ok(channel_id) => {
                                let from_tunnel = this.tunnel.register(channel_id);
                                crate::ingress::pump_channel(
                                    &this.tunnel,
                                    channel_id,
                                    stream,
                                    from_tunnel,
                                )
                                .await;
                            }
                            Err(e) => {
                                tracing::debug!(
                                    "forward open {}:{} for {peer} failed: {e}",
                                    this.host,
                                    this.port
                                );
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("forward accept error: {e}");
                }
            }
        }
    }

    async fn run_udp(self) -> Result<()> {
        let socket = UdpSocket::bind(&self.listen).await?;
        tracing::info!("forward {} -> {}:{} (udp)", self.listen, self.host, self.port);

        let this = Arc::new(self);
        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            let (n, _source) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("forward recv error: {e}");
                    continue;
                }
            };
            if n == 0 || !this.tunnel.is_connected() {
                continue;
            }

            let datagram = buf[..n].to_vec();
            let this = Arc::clone(&this);
            tokio::spawn(async move {
                this.relay_datagram(datagram).await;
            });
        }
    }

    /// One channel per datagram: open, a single DATA frame, then close
    /// remote-first. Reply traffic is not carried.
    async fn relay_datagram(&self, datagram: Vec<u8>) {
        match self.tunnel.open(&self.host, self.port).await {
            Ok(channel_id) => {
                let _ = self.tunnel.send_data(channel_id, &datagram).await;
                self.tunnel.close_remote(channel_id).await;
                self.tunnel.close_local(channel_id);
            }
            Err(e) => {
                tracing::debug!("forward open {}:{} failed: {e}", self.host, self.port);
            }
        }
    }
}

/// Split a `host:port` destination, tolerating bracketed IPv6.
fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::config(format!("invalid forward address: {addr}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::config(format!("invalid forward port in: {addr}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::config(format!("invalid forward address: {addr}")));
    }
    Ok((host.to_string(), port))
}
