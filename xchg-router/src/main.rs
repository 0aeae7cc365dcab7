// xchg router daemon: TCP relay + HTTP mailbox until Ctrl+C / SIGTERM.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xchg_core::Keypair;
use xchg_router::{config, Router};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("xchg-router {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let keypair = Arc::new(load_or_generate_key(cfg.key_file.as_deref())?);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let router = Router::bind(cfg, keypair)
            .await
            .context("cannot bind router listeners")?;
        tokio::select! {
            r = router.clone().run() => r.context("router stopped")?,
            r = shutdown_signal() => r?,
        }
        info!("shutting down");
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
