//! proxywasm-bridge CLI entry point.
//!
//! Loads one proxy-wasm guest and serves HTTP requests through it.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxywasm_bridge_common::ConfigFile;
use proxywasm_bridge_server::{AppState, BridgeServer, ServerConfig};

/// Drive a proxy-wasm guest from an HTTP server.
#[derive(Parser, Debug)]
#[command(name = "proxywasm-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Guest module to load, overriding `[guest].path`
    #[arg(short, long, env = "BRIDGE_MODULE")]
    module: Option<PathBuf>,

    /// Address to listen on, overriding `[server].bind_addr`
    #[arg(short, long, env = "BIND_ADDR")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,proxywasm_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ConfigFile::default(),
    };

    let module = args
        .module
        .or_else(|| config.guest.path.as_ref().map(PathBuf::from))
        .context("No guest module given. Pass --module or set [guest].path")?;

    let mut server_config = ServerConfig::from_file_section(&config.server)?;
    if let Some(bind) = args.bind {
        server_config = server_config.with_bind_addr(bind);
    }

    info!(
        module = %module.display(),
        bind_addr = %server_config.bind_addr,
        "Configuration loaded"
    );

    let state = AppState::from_file(&config.runtime, &module)
        .with_context(|| format!("Failed to start guest {}", module.display()))?;

    info!(root_id = state.plugin().root_id(), "Guest started. Available endpoints:");
    info!("  GET  /health  - Health check");
    info!("  GET  /ready   - Readiness check");
    info!("  ANY  /*       - Run the guest on the request headers");

    BridgeServer::new(state, server_config).run().await?;

    Ok(())
}
