//! Configuration type definitions.

use serde::Deserialize;

/// Default outbound queue depth (messages) before a connection is dropped
/// for `SendQueueExceeded`.
pub const DEFAULT_SENDQ: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub listen: ListenConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Path to the MOTD file.
    #[serde(default)]
    pub motd: Option<String>,
    #[serde(default)]
    pub opers: Vec<OperBlock>,
    #[serde(default)]
    pub links: Vec<LinkBlock>,
    /// Per-user overrides, matched against `user@host`.
    #[serde(default)]
    pub users: Vec<UserOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Our FQDN, e.g. `irc.example.net`.
    pub name: String,
    /// Our TS6 server id: three characters, uppercase alphanumeric.
    pub sid: String,
    /// Free-form description shown in WHOIS and the SID burst.
    pub description: String,
    #[serde(default = "default_max_nick_length")]
    pub max_nick_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    /// Plaintext listener port; optional when only TLS is offered.
    pub port: Option<u16>,
    pub tls_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Durations are whole seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Idle time before we PING a connection; also the registration and
    /// burst-completion deadline.
    #[serde(default = "default_ping_time")]
    pub ping_time: u64,
    /// Idle time before a silent connection is dropped.
    #[serde(default = "default_dead_time")]
    pub dead_time: u64,
    /// Interval between outbound link attempts.
    #[serde(default = "default_connect_attempt_time")]
    pub connect_attempt_time: u64,
    /// Largest tolerated SVINFO clock delta.
    #[serde(default = "default_max_ts_skew")]
    pub max_ts_skew: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ping_time: default_ping_time(),
            dead_time: default_dead_time(),
            connect_attempt_time: default_connect_attempt_time(),
            max_ts_skew: default_max_ts_skew(),
        }
    }
}

/// Operator credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct OperBlock {
    pub name: String,
    pub password: String,
}

/// A configured server link.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkBlock {
    /// Remote server name; must match what the peer announces.
    pub name: String,
    pub hostname: String,
    pub port: u16,
    /// Shared link password.
    pub password: String,
    #[serde(default)]
    pub tls: bool,
    /// Dial this link from the tick loop when it is down.
    #[serde(default)]
    pub autoconnect: bool,
    /// Expected remote SID, checked when present.
    #[serde(default)]
    pub sid: Option<String>,
}

/// Per-user override, matched against `user@host` at registration.
#[derive(Debug, Clone, Deserialize)]
pub struct UserOverride {
    pub mask: String,
    #[serde(default)]
    pub flood_exempt: bool,
    /// Outbound queue depth override.
    #[serde(default)]
    pub sendq: Option<usize>,
}

fn default_max_nick_length() -> usize {
    30
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ping_time() -> u64 {
    120
}

fn default_dead_time() -> u64 {
    240
}

fn default_connect_attempt_time() -> u64 {
    60
}

fn default_max_ts_skew() -> u64 {
    60
}
