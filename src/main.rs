//! hotswap-proxy
//!
//! A reverse proxy whose hosts, listeners, locations and upstreams can
//! change at runtime without dropping connections.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────┐
//!                    │                    HOTSWAP PROXY                      │
//!                    │                                                       │
//!   mutations ──────▶│  ┌────────────┐  change feed  ┌────────────┐          │
//!                    │  │   store    │──────────────▶│ supervisor │          │
//!                    │  └────────────┘               └─────┬──────┘          │
//!                    │                     snapshot swap / │ restart          │
//!                    │                                     ▼                  │
//!   Client ─────────▶│  ┌─────────┐   ┌─────────┐   ┌──────────────┐         │
//!                    │  │   net   │──▶│  http   │──▶│   routing    │         │
//!                    │  │listener │   │ server  │   │  snapshot    │         │
//!                    │  └─────────┘   └─────────┘   └──────┬───────┘         │
//!                    │                                      ▼                 │
//!                    │                middleware chain → proxy → pool ───────┼──▶ Backend
//!                    │                                                       │
//!                    │  config · health · observability · lifecycle          │
//!                    └──────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use hotswap_proxy::config::{load_config, ProxyConfig};
use hotswap_proxy::health::{HealthPolicy, HealthTracker};
use hotswap_proxy::lifecycle::{seed_store, wait_for_shutdown_signal, Shutdown};
use hotswap_proxy::middleware::Registry;
use hotswap_proxy::observability::{logging, metrics};
use hotswap_proxy::routing::BuildContext;
use hotswap_proxy::store::MemoryStore;
use hotswap_proxy::supervisor::{Supervisor, SupervisorSettings};

#[derive(Parser, Debug)]
#[command(name = "hotswap-proxy", version, about = "Dynamically reconfigurable reverse proxy")]
struct Cli {
    /// Path to the TOML configuration file; defaults apply without it.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "hotswap-proxy starting");

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr);
    }

    let registry = Registry::global();
    tracing::info!(middleware_types = ?registry.type_names(), "Middleware registry ready");

    let store = Arc::new(MemoryStore::new(registry));
    seed_store(store.as_ref(), &config)?;

    let health = Arc::new(HealthTracker::new(HealthPolicy::from(&config.health)));
    let ctx = BuildContext::new(registry, health, config.retries.clone(), config.router.clone());
    let supervisor = Supervisor::new(store, ctx, SupervisorSettings::from_config(&config));

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal.trigger();
    });

    supervisor.run(shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
