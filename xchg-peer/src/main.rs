// xchg peer: serve this node's address, or call a function on another one.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;
use xchg_core::{Address, Keypair, ServerProcessor};
use xchg_peer::{config, Peer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: xchg-peer [serve | address | call <address> <function> [data]]";

/// Answers `version`, echoes everything else. Auth data must equal XCHG_AUTH when it is set.
struct DemoProcessor {
    password: Option<String>,
}

impl ServerProcessor for DemoProcessor {
    fn auth(&self, auth_data: &[u8]) -> Result<(), String> {
        match &self.password {
            Some(p) if p.as_bytes() != auth_data => Err("access denied".to_string()),
            _ => Ok(()),
        }
    }

    fn call(&self, function: &str, parameter: &[u8]) -> Result<Vec<u8>, String> {
        match function {
            "version" => Ok(VERSION.as_bytes().to_vec()),
            _ => Ok(parameter.to_vec()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("xchg-peer {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let keypair = Arc::new(load_or_generate_key(cfg.key_file.as_deref())?);

    let command = args.first().map(String::as_str).unwrap_or("serve");
    if command == "address" {
        println!("{}", keypair.address());
        return Ok(());
    }

    let processor = Arc::new(DemoProcessor {
        password: std::env::var("XCHG_AUTH").ok(),
    });
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match command {
            "serve" => {
                let peer = Peer::start(cfg, keypair, processor).await?;
                println!("{}", peer.address());
                shutdown_signal().await?;
                peer.shutdown().await;
            }
            "call" => {
                let (Some(address), Some(function)) = (args.get(1), args.get(2)) else {
                    bail!(USAGE);
                };
                let address: Address = address.parse().context("bad address")?;
                let data = args.get(3).map(String::as_bytes).unwrap_or_default();
                let auth = std::env::var("XCHG_AUTH").unwrap_or_default();
                let timeout = cfg.call_timeout();
                let peer = Peer::start(cfg, keypair, processor).await?;
                let result = peer
                    .call(&address, auth.as_bytes(), function, data, timeout)
                    .await;
                peer.shutdown().await;
                let out = result.with_context(|| format!("call {function} failed"))?;
                println!("{}", String::from_utf8_lossy(&out));
            }
            _ => bail!(USAGE),
        }
        info!("done");
        Ok::<(), anyhow::Error>(())
    })
}

fn load_or_generate_key(path: Option<&Path>) -> anyhow::Result<Keypair> {
    let Some(path) = path else {
        return Ok(Keypair::generate()?);
    };
    if path.exists() {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read key file {}", path.display()))?;
        return Ok(Keypair::from_pkcs8_pem(&pem)?);
    }
    let keypair = Keypair::generate()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, keypair.to_pkcs8_pem()?)
        .with_context(|| format!("cannot write key file {}", path.display()))?;
    info!(path = %path.display(), "generated new key");
    Ok(keypair)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
