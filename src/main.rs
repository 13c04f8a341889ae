//! relaydns - A multi-protocol DNS forwarding proxy with caching, per-domain
//! routing, fallback resolvers, and EDNS Client Subnet support.

// Use jemalloc as the global allocator (Linux/macOS only, better performance)
#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod cache;
mod config;
mod dispatch;
mod ecs;
mod error;
mod http;
mod proxy;
mod routing;
mod server;
mod upstream;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::proxy::Proxy;

/// relaydns - A multi-protocol DNS forwarding proxy.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config_path = args.config;

    // Load configuration
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Initialize logging
    init_logging(&config.server.log_level)?;

    info!("Starting relaydns DNS proxy");
    info!("Config loaded from: {:?}", config_path);

    // Build the resolution engine
    let options = config
        .proxy_options()
        .context("Failed to build the resolution engine")?;
    let proxy = Arc::new(Proxy::new(options));

    // Bind listeners
    proxy
        .clone()
        .start(&config.server)
        .await
        .context("Failed to start the DNS proxy")?;

    // Run until interrupted
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for the shutdown signal")?;
    info!("Shutdown signal received, stopping");

    proxy.stop().await?;

    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(!cfg!(windows))
        .init();

    Ok(())
}
