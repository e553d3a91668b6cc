//! ucrelay-balancer: load balancer service.
//!
//! Answers RegisterServer / ResolveServer / Heartbeat requests using a shared
//! connection registry (remote, or embedded in-memory for development).

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ucrelay_balancer::config::BalancerConfig;
use ucrelay_balancer::{BalancerServer, LoadBalancer};
use ucrelay_registry::{ConnectionRegistry, MemoryRegistry, RemoteRegistry};

/// ucrelay-balancer: server placement and resolution
#[derive(Parser, Debug)]
#[command(name = "ucrelay-balancer", version, about = "ucrelay load balancer")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Registry service address (host:port), or "memory" for an embedded registry
    #[arg(long)]
    registry: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ucrelay/balancer.toml")]
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
    let config = match BalancerConfig::load(
        Some(&config_path),
        cli.listen.as_deref(),
        cli.registry.as_deref(),
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
        registry = %config.registry,
        "starting ucrelay-balancer"
    );

    let registry: Arc<dyn ConnectionRegistry> = if config.embedded_registry() {
        warn!("using embedded in-memory registry; state is not shared with other balancers");
        Arc::new(MemoryRegistry::default())
    } else {
        Arc::new(RemoteRegistry::new(
            config.registry.clone(),
            config.settings.registry_timeout,
        ))
    };

    let listener = match TcpListener::bind(&config.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.listen, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let balancer = Arc::new(LoadBalancer::new(registry, config.settings.clone()));
    let shutdown = CancellationToken::new();

    tokio::select! {
        result = BalancerServer::new(balancer).run(listener, shutdown.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "balancer error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }
    shutdown.cancel();

    info!("ucrelay-balancer stopped");
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
