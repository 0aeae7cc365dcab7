//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use xchg_core::protocol::{DEFAULT_ROUTER_HTTP_PORT, DEFAULT_ROUTER_TCP_PORT};

/// Router configuration. File: ~/.config/xchg/router.toml or /etc/xchg/router.toml.
/// Env overrides: XCHG_ROUTER_BIND, XCHG_ROUTER_TCP_PORT, XCHG_ROUTER_HTTP_PORT, XCHG_ROUTER_KEY_FILE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Interface for both listeners (default 0.0.0.0).
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// TCP relay port (default 8484).
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// HTTP status + mailbox port (default 8485).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Connections that have not finished the handshake by then are dropped.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Relayed calls without a final response by then are forgotten.
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Unread mailbox envelopes expire after this long.
    #[serde(default = "default_mailbox_ttl_secs")]
    pub mailbox_ttl_secs: u64,
    /// PKCS#8 PEM private key; generated (and written) when missing.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_tcp_port() -> u16 {
    DEFAULT_ROUTER_TCP_PORT
}
fn default_http_port() -> u16 {
    DEFAULT_ROUTER_HTTP_PORT
}
fn default_handshake_timeout_ms() -> u64 {
    3000
}
fn default_transaction_timeout_ms() -> u64 {
    3000
}
fn default_sweep_interval_ms() -> u64 {
    1000
}
fn default_mailbox_ttl_secs() -> u64 {
    30
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            tcp_port: default_tcp_port(),
            http_port: default_http_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            mailbox_ttl_secs: default_mailbox_ttl_secs(),
            key_file: None,
        }
    }
}

impl RouterConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }

    pub fn mailbox_ttl(&self) -> Duration {
        Duration::from_secs(self.mailbox_ttl_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> RouterConfig {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("XCHG_ROUTER_BIND") {
        c.bind_host = s;
    }
    if let Ok(s) = std::env::var("XCHG_ROUTER_TCP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.tcp_port = p;
        }
    }
    if let Ok(s) = std::env::var("XCHG_ROUTER_HTTP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.http_port = p;
        }
    }
    if let Some(p) = std::env::var_os("XCHG_ROUTER_KEY_FILE") {
        c.key_file = Some(PathBuf::from(p));
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/xchg/router.toml"));
    }
    out.push(PathBuf::from("/etc/xchg/router.toml"));
    out
}

fn load_file() -> Option<RouterConfig> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<RouterConfig>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
