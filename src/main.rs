use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ssh_key::{PrivateKey, PublicKey};
use tokio::sync::watch;
use tracing::info;

use sshgate::auth::PassThroughPolicy;
use sshgate::{Config, ProxyContext, ProxyServer, ServerIdentity, StaticResolver};

/// Transparent SSH authentication relay.
#[derive(Debug, Parser)]
#[command(name = "sshgate", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, value_name = "FILE", default_value = "sshgate.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let host_key = load_host_key(&config.host_key)?;
    let pinned_backend_key = config
        .backend_host_key
        .as_deref()
        .map(PublicKey::from_openssh)
        .transpose()
        .context("invalid backend_host_key in configuration")?;

    let ctx = Arc::new(ProxyContext {
        identity: ServerIdentity::new(vec![host_key]),
        resolver: Arc::new(StaticResolver::new(config.routes.clone())),
        policy: Arc::new(PassThroughPolicy),
        destination_port: config.destination_port,
        pinned_backend_key,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    let server = ProxyServer::new(ctx, config.listen_addr.clone());
    server.bind().await?.serve(shutdown_rx).await?;
    Ok(())
}

fn load_host_key(path: &std::path::Path) -> Result<PrivateKey> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read host key {}", path.display()))?;
    PrivateKey::from_openssh(&data)
        .with_context(|| format!("{} is not a valid OpenSSH private key", path.display()))
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}
