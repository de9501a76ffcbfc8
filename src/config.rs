//! Unified TOML configuration.
//!
//! One file carries both roles: `[server]` for the responder (listener,
//! cover hostname, TLS material, principals) and `[client]` for the
//! initiator (server address, credentials, trust settings, ingress
//! listeners, reconnect pacing). Binaries validate only the section
//! they run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

/// Responder-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, host:port
    pub listen: String,
    /// Hostname announced in the cover greeting
    pub hostname: String,
    /// PEM certificate chain
    pub cert_file: String,
    /// PEM private key
    pub key_file: String,
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
    pub tls: TlsSettings,
    /// Authenticated principals
    pub users: Vec<Principal>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:587".to_string(),
            hostname: "mail.example.com".to_string(),
            cert_file: String::new(),
            key_file: String::new(),
            log_level: "info".to_string(),
            tls: TlsSettings::default(),
            users: Vec::new(),
        }
    }
}

/// TLS policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Minimum protocol version, "1.2" or "1.3"
    pub min_version: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            min_version: "1.2".to_string(),
        }
    }
}

/// One authenticated identity with its access policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    pub secret: String,
    /// Allowed source ranges: CIDR prefixes or singleton IPs
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,
    /// Whether per-channel traffic is logged for this principal
    #[serde(default = "default_true")]
    pub logging: bool,
}

/// Initiator-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Tunnel server address, host:port
    pub server: String,
    pub username: String,
    pub secret: String,
    /// Trust anchors for the server certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
    /// Accept any server certificate (testing only)
    pub insecure_skip_verify: bool,
    /// Initial reconnect delay in seconds
    pub reconnect_delay_secs: u64,
    /// Reconnect delay cap in seconds
    pub max_reconnect_delay_secs: u64,
    /// SOCKS5 listeners
    pub socks: Vec<SocksEntry>,
    /// Static port-forward rules
    pub forward: Vec<ForwardEntry>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            username: String::new(),
            secret: String::new(),
            ca_cert: None,
            insecure_skip_verify: false,
            reconnect_delay_secs: 2,
            max_reconnect_delay_secs: 30,
            socks: Vec::new(),
            forward: Vec::new(),
        }
    }
}

/// One SOCKS5 listener. Empty username disables the
/// username/password method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocksEntry {
    pub listen: String,
    pub username: String,
    pub password: String,
}

/// One static forward rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardEntry {
    /// Local bind address
    pub listen: String,
    /// Destination host:port reached through the tunnel
    pub to: String,
    /// "tcp" or "udp"
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_whitelist() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl Config {
    /// Read and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("read {}: {e}", path.display())))?;
        Self::parse(&data)
    }

    /// Parse configuration from TOML text.
    pub fn parse(data: &str) -> Result<Self> {
        let cfg: Config =
            toml::from_str(data).map_err(|e| Error::config(format!("parse config: {e}")))?;

        for user in &cfg.server.users {
            if user.secret.is_empty() {
                return Err(Error::config(format!(
                    "user {:?} has no secret",
                    user.username
                )));
            }
        }

        Ok(cfg)
    }

    /// Validate the fields the server binary needs.
    pub fn validate_server(&self) -> Result<()> {
        if self.server.listen.is_empty() {
            return Err(Error::config("server.listen is required"));
        }
        if self.server.cert_file.is_empty() {
            return Err(Error::config("server.cert_file is required"));
        }
        if self.server.key_file.is_empty() {
            return Err(Error::config("server.key_file is required"));
        }
        if self.server.users.is_empty() {
            return Err(Error::config(
                "at least one [[server.users]] entry is required",
            ));
        }
        Ok(())
    }

    /// Validate the fields the client binary needs.
    pub fn validate_client(&self) -> Result<()> {
        if self.client.server.is_empty() {
            return Err(Error::config("client.server is required"));
        }
        if self.client.username.is_empty() {
            return Err(Error::config("client.username is required"));
        }
        if self.client.secret.is_empty() {
            return Err(Error::config("client.secret is required"));
        }
        if self.client.socks.is_empty() && self.client.forward.is_empty() {
            return Err(Error::config(
                "at least one [[client.socks]] or [[client.forward]] entry is required",
            ));
        }
        for rule in &self.client.forward {
            match rule.protocol.as_str() {
                "tcp" | "udp" => {}
                other => {
                    return Err(Error::config(format!(
                        "forward protocol must be tcp or udp, got {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Principal lookup map (name → secret) for token verification.
    pub fn principals(&self) -> HashMap<String, String> {
        self.server
            .users
            .iter()
            .map(|u| (u.username.clone(), u.secret.clone()))
            .collect()
    }

    /// Look up a principal by name.
    pub fn find_user(&self, username: &str) -> Option<&Principal> {
        self.server.users.iter().find(|u| u.username == username)
    }

    /// Initial reconnect delay.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.client.reconnect_delay_secs.max(1))
    }

    /// Reconnect delay cap.
    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(
            self.client
                .max_reconnect_delay_secs
                .max(self.client.reconnect_delay_secs.max(1)),
        )
    }
}

/// Commented default configuration written by `mailtun-server init`.
pub const DEFAULT_CONFIG: &str = r#"# mailtun configuration (unified)
# All settings for server, client, and users in one file.

[server]
listen = "0.0.0.0:587"
hostname = "mail.example.com"
cert_file = "server.crt"
key_file = "server.key"
log_level = "info"

[server.tls]
min_version = "1.2"

# Add users with: mailtun-server adduser <name> -c config.toml
# [[server.users]]
# username = "alice"
# secret = "auto-generated-secret"
# whitelist = ["0.0.0.0/0"]
# logging = true

[client]
server = "mail.example.com:587"
username = ""
secret = ""
ca_cert = "ca.crt"
insecure_skip_verify = false
reconnect_delay_secs = 2
max_reconnect_delay_secs = 30

[[client.socks]]
listen = "127.0.0.1:1080"
username = ""
password = ""

# [[client.forward]]
# listen = "127.0.0.1:5900"
# to = "10.0.0.5:5900"
# protocol = "tcp"
"#;
