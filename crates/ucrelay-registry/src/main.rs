//! ucrelay-registry: connection registry service.
//!
//! Hosts an in-memory registry and serves it to balancers and proxies over
//! length-prefixed CBOR RPC.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use ucrelay_registry::config::RegistryConfig;
use ucrelay_registry::{MemoryRegistry, RegistryService};

/// ucrelay-registry: shared routing state
#[derive(Parser, Debug)]
#[command(name = "ucrelay-registry", version, about = "ucrelay connection registry")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// How long offline entries are remembered, in seconds
    #[arg(long)]
    tombstone_retention: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.ucrelay/registry.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match RegistryConfig::load(
        Some(&config_path),
        cli.listen.as_deref(),
        cli.tombstone_retention,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        retention_secs = config.tombstone_retention.as_secs(),
        "starting ucrelay-registry"
    );

    let listener = match TcpListener::bind(&config.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.listen, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(MemoryRegistry::new(config.tombstone_retention));
    let shutdown = CancellationToken::new();

    // Periodic purge of stale tombstones and proxy records
    let purge_registry = registry.clone();
    let purge_shutdown = shutdown.clone();
    let purge_interval = config.purge_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_interval);
        loop {
            tokio::select! {
                _ = purge_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    purge_registry.purge();
                    let stats = purge_registry.stats();
                    info!(
                        live = stats.live,
                        offline = stats.offline,
                        proxies = stats.proxies,
                        "registry stats"
                    );
                }
            }
        }
    });

    let service = RegistryService::new(registry);
    tokio::select! {
        result = service.run(listener, shutdown.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "registry service error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }
    shutdown.cancel();

    info!("ucrelay-registry stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
