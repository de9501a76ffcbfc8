//! Initiator control loop: connect, run, reconnect.
//!
//! The supervisor dials the server with exponential backoff, runs the
//! cover handshake, spawns the session receiver and the configured
//! ingress adapters, and rebuilds everything when the session drops.
//! There is no upper bound on attempts.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handshake;
use crate::ingress::{Forwarder, Socks5Server};
use crate::tls;
use crate::tunnel::{Tunnel, TunnelReader};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deterministic exponential backoff: double up to a cap, reset on
/// success.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Return the next delay and advance the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Return the backoff to its initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Dial the configured server and run the cover handshake once.
///
/// Used by the supervisor loop and by diagnostics that want a session
/// without ingress adapters.
pub async fn establish(
    config: &Config,
    connector: &TlsConnector,
) -> Result<(Arc<Tunnel>, TunnelReader)> {
    let addr = &config.client.server;
    tracing::info!("connecting to {addr}");

    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout("server dial"))??;

    let sni = handshake::host_from_addr(addr);
    let tls_stream = handshake::client_handshake(
        stream,
        sni,
        &config.client.username,
        &config.client.secret,
        connector,
    )
    .await?;

    tracing::info!("connected, binary mode active");
    Ok(Tunnel::new(tls_stream))
}

/// The reconnect loop.
pub struct Supervisor {
    config: Arc<Config>,
    connector: TlsConnector,
}

impl Supervisor {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let connector = tls::connector(
            config.client.ca_cert.as_deref(),
            config.client.insecure_skip_verify,
        )?;
        Ok(Self { config, connector })
    }

    /// Run forever: each successful session resets the backoff; each
    /// failure or session loss sleeps and retries.
    pub async fn run(&self) {
        let mut backoff = ExponentialBackoff::new(
            self.config.reconnect_delay(),
            self.config.max_reconnect_delay(),
        );

        loop {
            let (tunnel, reader) = match establish(&self.config, &self.connector).await {
                Ok(session) => session,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("connection failed: {e}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            backoff.reset();

            let receiver = tokio::spawn(Arc::clone(&tunnel).run_receiver(reader));
            let ingress_tasks = self.start_ingress(&tunnel);

            // The receiver returns when the transport ends.
            let _ = receiver.await;

            for task in ingress_tasks {
                task.abort();
            }
            tunnel.disconnect();
            tracing::warn!("connection lost, reconnecting");
        }
    }

    fn start_ingress(&self, tunnel: &Arc<Tunnel>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();

        for entry in &self.config.client.socks {
            let server = Socks5Server::new(entry, Arc::clone(tunnel));
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    tracing::warn!("SOCKS5 ingress error: {e}");
                }
            }));
        }

        for entry in &self.config.client.forward {
            match Forwarder::from_entry(entry, Arc::clone(tunnel)) {
                Ok(forwarder) => {
                    tasks.push(tokio::spawn(async move {
                        if let Err(e) = forwarder.run().await {
                            tracing::warn!("forward ingress error: {e}");
                        }
                    }));
                }
                Err(e) => {
                    tracing::warn!("skipping forward rule: {e}");
                }
            }
        }

        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(50), Duration::from_millis(200));

        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        // Capped thereafter.
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(50), Duration::from_millis(200));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_defaults_shape() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }
}
