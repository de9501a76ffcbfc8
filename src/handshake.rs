//! The mail-submission cover dialog.
//!
//! Both ends of a tunnel session speak a line-oriented submission-port
//! exchange before switching to binary framing: greeting, capability
//! advertisement, STARTTLS upgrade, a second EHLO over TLS, an
//! `AUTH PLAIN` token exchange, and finally a `BINARY` switch. To a
//! middlebox the transcript is an ordinary opportunistic-TLS mail
//! submission.
//!
//! Every line read/write and both TLS handshakes carry a 60-second
//! deadline; nothing is deadline-bound once `299` has been exchanged.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::crypto::token;
use crate::error::{Error, Result};

const STEP_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity the client announces in its EHLO lines.
const CLIENT_EHLO_NAME: &str = "tunnel-client.local";

/// Line-oriented view of a stream during the dialog.
///
/// The dialog is strictly request/response: each side reads nothing
/// until the other has answered, so the read buffer is provably empty
/// at both upgrade points (STARTTLS and the switch to binary framing)
/// and `into_inner` cannot discard bytes.
struct LineStream<S> {
    inner: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineStream<S> {
    fn new(stream: S) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let framed = format!("{line}\r\n");
        let io = async {
            self.inner.get_mut().write_all(framed.as_bytes()).await?;
            self.inner.get_mut().flush().await
        };
        timeout(STEP_TIMEOUT, io)
            .await
            .map_err(|_| Error::Timeout("handshake write"))??;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = timeout(STEP_TIMEOUT, self.inner.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout("handshake read"))??;
        if n == 0 {
            return Err(Error::handshake("connection closed during dialog"));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Read a line and require the given reply-code prefix (exact match).
    async fn expect(&mut self, prefix: &str, step: &'static str) -> Result<String> {
        let line = self.read_line().await?;
        if !line.starts_with(prefix) {
            return Err(Error::handshake(format!(
                "{step}: expected {prefix}, got: {line}"
            )));
        }
        Ok(line)
    }

    /// Consume a multi-line `250-…` capability block up to its
    /// `250 ` terminator.
    async fn expect_capabilities(&mut self, step: &'static str) -> Result<()> {
        loop {
            let line = self.read_line().await?;
            if line.starts_with("250 ") {
                return Ok(());
            }
            if line.starts_with("250-") {
                continue;
            }
            return Err(Error::handshake(format!(
                "{step}: unexpected response: {line}"
            )));
        }
    }

    fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

/// Drive the responder side of the cover dialog.
///
/// On success returns the authenticated principal name and the TLS
/// stream positioned at the start of binary framing. On an invalid
/// token the peer has already been sent `535 5.7.8` and the stream
/// should be dropped.
pub async fn server_handshake<S>(
    stream: S,
    hostname: &str,
    acceptor: &TlsAcceptor,
    principals: &HashMap<String, String>,
) -> Result<(String, server::TlsStream<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = LineStream::new(stream);

    lines
        .write_line(&format!("220 {hostname} ESMTP Postfix (Ubuntu)"))
        .await?;

    let line = lines.read_line().await?;
    let upper = line.to_ascii_uppercase();
    if !upper.starts_with("EHLO") && !upper.starts_with("HELO") {
        return Err(Error::handshake(format!("expected EHLO, got: {line}")));
    }

    lines.write_line(&format!("250-{hostname}")).await?;
    lines.write_line("250-STARTTLS").await?;
    lines.write_line("250-AUTH PLAIN LOGIN").await?;
    lines.write_line("250 8BITMIME").await?;

    let line = lines.read_line().await?;
    if !line.eq_ignore_ascii_case("STARTTLS") {
        return Err(Error::handshake(format!("expected STARTTLS, got: {line}")));
    }
    lines.write_line("220 2.0.0 Ready to start TLS").await?;

    let tls = timeout(STEP_TIMEOUT, acceptor.accept(lines.into_inner()))
        .await
        .map_err(|_| Error::Timeout("tls accept"))?
        .map_err(|e| Error::tls(e.to_string()))?;

    let mut lines = LineStream::new(tls);

    let line = lines.read_line().await?;
    let upper = line.to_ascii_uppercase();
    if !upper.starts_with("EHLO") && !upper.starts_with("HELO") {
        return Err(Error::handshake(format!(
            "expected EHLO after TLS, got: {line}"
        )));
    }

    lines.write_line(&format!("250-{hostname}")).await?;
    lines.write_line("250-AUTH PLAIN LOGIN").await?;
    lines.write_line("250 8BITMIME").await?;

    let line = lines.read_line().await?;
    if !line.to_ascii_uppercase().starts_with("AUTH") {
        return Err(Error::handshake(format!("expected AUTH, got: {line}")));
    }

    let parts: Vec<&str> = line.splitn(3, ' ').collect();
    if parts.len() < 3 {
        lines.write_line("535 5.7.8 Authentication failed").await?;
        return Err(Error::Auth);
    }

    let username = match token::verify_token(parts[2], principals, token::MAX_TOKEN_AGE_SECS) {
        Some(name) => name,
        None => {
            lines.write_line("535 5.7.8 Authentication failed").await?;
            return Err(Error::Auth);
        }
    };

    lines.write_line("235 2.7.0 Authentication successful").await?;

    let line = lines.read_line().await?;
    if !line.eq_ignore_ascii_case("BINARY") {
        return Err(Error::handshake(format!("expected BINARY, got: {line}")));
    }
    lines.write_line("299 Binary mode activated").await?;

    Ok((username, lines.into_inner()))
}

/// Drive the initiator side of the cover dialog.
///
/// `sni` names the server for certificate verification; callers default
/// it to the host portion of the server address. On success the TLS
/// stream is positioned at the start of binary framing.
pub async fn client_handshake<S>(
    stream: S,
    sni: &str,
    username: &str,
    secret: &str,
    connector: &TlsConnector,
) -> Result<client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = LineStream::new(stream);

    lines.expect("220", "greeting").await?;

    lines.write_line(&format!("EHLO {CLIENT_EHLO_NAME}")).await?;
    lines.expect_capabilities("ehlo").await?;

    lines.write_line("STARTTLS").await?;
    lines.expect("220", "starttls").await?;

    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|_| Error::tls(format!("invalid server name: {sni}")))?;
    let tls = timeout(
        STEP_TIMEOUT,
        connector.connect(server_name, lines.into_inner()),
    )
    .await
    .map_err(|_| Error::Timeout("tls connect"))?
    .map_err(|e| Error::tls(e.to_string()))?;

    let mut lines = LineStream::new(tls);

    lines.write_line(&format!("EHLO {CLIENT_EHLO_NAME}")).await?;
    lines.expect_capabilities("ehlo post-tls").await?;

    let auth_token = token::generate_token(secret, username, token::unix_now());
    lines.write_line(&format!("AUTH PLAIN {auth_token}")).await?;
    lines.expect("235", "auth").await?;

    lines.write_line("BINARY").await?;
    lines.expect("299", "binary mode").await?;

    Ok(lines.into_inner())
}

/// Extract the host portion of a `host:port` address, for SNI defaults.
pub fn host_from_addr(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            host.trim_start_matches('[').trim_end_matches(']')
        }
        _ => addr,
    }
}
