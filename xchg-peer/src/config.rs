//! Load config from file and environment.

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use xchg_core::protocol::{DEFAULT_UDP_PORT_END, DEFAULT_UDP_PORT_START};

/// Ways to reach a remote peer, tried in the configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Http,
    Router,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Udp => "udp",
            Self::Http => "http",
            Self::Router => "router",
        })
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "http" => Ok(Self::Http),
            "router" => Ok(Self::Router),
            other => Err(format!("unknown transport {other:?}")),
        }
    }
}

/// Peer configuration. File: ~/.config/xchg/peer.toml or /etc/xchg/peer.toml.
/// Env overrides: XCHG_UDP_PORT_START, XCHG_UDP_PORT_END, XCHG_BROADCAST, XCHG_ROUTERS,
/// XCHG_HTTP_RELAYS, XCHG_TRANSPORTS (comma-separated lists), XCHG_KEY_FILE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Bind a UDP socket for LAN discovery and direct calls.
    #[serde(default = "default_true")]
    pub udp_enabled: bool,
    /// First port tried for the UDP socket (default 42000). Discovery covers the whole range.
    #[serde(default = "default_udp_port_start")]
    pub udp_port_start: u16,
    #[serde(default = "default_udp_port_end")]
    pub udp_port_end: u16,
    /// Where discovery requests go (default 255.255.255.255).
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,
    /// Router TCP endpoints (host:port) kept connected.
    #[serde(default)]
    pub routers: Vec<String>,
    /// Router HTTP endpoints (host:port) used as mailboxes.
    #[serde(default)]
    pub http_relays: Vec<String>,
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    /// PKCS#8 PEM private key; generated (and written) when missing.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_udp_port_start() -> u16 {
    DEFAULT_UDP_PORT_START
}
fn default_udp_port_end() -> u16 {
    DEFAULT_UDP_PORT_END
}
fn default_broadcast_addr() -> String {
    "255.255.255.255".to_string()
}
fn default_transports() -> Vec<TransportKind> {
    vec![TransportKind::Udp, TransportKind::Http, TransportKind::Router]
}
fn default_call_timeout_ms() -> u64 {
    5000
}
fn default_discovery_timeout_ms() -> u64 {
    500
}
fn default_session_idle_secs() -> u64 {
    60
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            udp_enabled: default_true(),
            udp_port_start: default_udp_port_start(),
            udp_port_end: default_udp_port_end(),
            broadcast_addr: default_broadcast_addr(),
            routers: Vec::new(),
            http_relays: Vec::new(),
            transports: default_transports(),
            call_timeout_ms: default_call_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            session_idle_secs: default_session_idle_secs(),
            key_file: None,
        }
    }
}

impl PeerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> PeerConfig {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("XCHG_UDP_PORT_START") {
        if let Ok(p) = s.parse::<u16>() {
            c.udp_port_start = p;
        }
    }
    if let Ok(s) = std::env::var("XCHG_UDP_PORT_END") {
        if let Ok(p) = s.parse::<u16>() {
            c.udp_port_end = p;
        }
    }
    if let Ok(s) = std::env::var("XCHG_BROADCAST") {
        c.broadcast_addr = s;
    }
    if let Ok(s) = std::env::var("XCHG_ROUTERS") {
        c.routers = split_list(&s);
    }
    if let Ok(s) = std::env::var("XCHG_HTTP_RELAYS") {
        c.http_relays = split_list(&s);
    }
    if let Ok(s) = std::env::var("XCHG_TRANSPORTS") {
        match split_list(&s).iter().map(|t| t.parse()).collect() {
            Ok(t) => c.transports = t,
            Err(e) => tracing::warn!(error = %e, "ignoring XCHG_TRANSPORTS"),
        }
    }
    if let Some(p) = std::env::var_os("XCHG_KEY_FILE") {
        c.key_file = Some(PathBuf::from(p));
    }
    c
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
        .collect()
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/xchg/peer.toml"));
    }
    out.push(PathBuf::from("/etc/xchg/peer.toml"));
    out
}

fn load_file() -> Option<PeerConfig> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<PeerConfig>(&s) {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transports_parse_in_order() {
        let c: PeerConfig = toml::from_str(
            r#"
            transports = ["router", "udp"]
            routers = ["10.0.0.1:8484"]
            "#,
        )
        .unwrap();
        assert_eq!(c.transports, vec![TransportKind::Router, TransportKind::Udp]);
        assert_eq!(c.udp_port_start, DEFAULT_UDP_PORT_START);
        assert_eq!(c.call_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn list_splitting_skips_blanks() {
        assert_eq!(split_list(" a:1, ,b:2,"), vec!["a:1", "b:2"]);
        assert!("ftp".parse::<TransportKind>().is_err());
    }
}
