//! ucrelay-proxy: relay proxy service.
//!
//! Accepts server and client connections over TCP and WebSocket, relays
//! frames between them and heartbeats to the balancer.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use ucrelay_balancer::BalancerClient;
use ucrelay_proxy::config::{Overrides, ProxyConfig};
use ucrelay_proxy::{HeartbeatEmitter, HookRegistry, ProxyNode, TrafficLog};
use ucrelay_registry::RemoteRegistry;

/// ucrelay-proxy: frame relay between servers and clients
#[derive(Parser, Debug)]
#[command(name = "ucrelay-proxy", version, about = "ucrelay relay proxy")]
struct Cli {
    /// Proxy id
    #[arg(long)]
    id: Option<String>,

    /// TCP listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// WebSocket listen address (host:port); empty disables WebSocket
    #[arg(long)]
    listen_ws: Option<String>,

    /// Address advertised to the balancer (tcp://host:port, or ws://host:port with the WebSocket listener on)
    #[arg(long)]
    advertise: Option<String>,

    /// Balancer address (host:port)
    #[arg(long)]
    balancer: Option<String>,

    /// Registry service address (host:port)
    #[arg(long)]
    registry: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ucrelay/proxy.toml")]
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
    let overrides = Overrides {
        id: cli.id.as_deref(),
        listen_tcp: cli.listen.as_deref(),
        listen_ws: cli.listen_ws.as_deref(),
        advertise: cli.advertise.as_deref(),
        balancer: cli.balancer.as_deref(),
        registry: cli.registry.as_deref(),
    };
    let config = match ProxyConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        proxy_id = %config.id,
        listen_tcp = %config.listen_tcp,
        listen_ws = config.listen_ws.as_deref().unwrap_or("-"),
        advertise = %config.advertise,
        balancer = %config.balancer,
        registry = %config.registry,
        "starting ucrelay-proxy"
    );

    let auth = match config.auth.build() {
        Ok(auth) => auth,
        Err(e) => {
            error!(error = %e, "invalid auth config");
            std::process::exit(1);
        }
    };

    let hooks = Arc::new(HookRegistry::new(
        config.hooks.order,
        Duration::from_millis(config.hooks.timeout_ms),
    ));
    match config.hooks.log_ranges() {
        Ok(ranges) if !ranges.is_empty() => hooks.register(Arc::new(TrafficLog::new(ranges))),
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "invalid hook config");
            std::process::exit(1);
        }
    }

    let registry = Arc::new(RemoteRegistry::new(config.registry.clone(), config.rpc_timeout));
    let node = Arc::new(ProxyNode::new(
        config.id.clone(),
        config.settings.clone(),
        registry,
        auth,
        hooks,
    ));

    let tcp = match TcpListener::bind(&config.listen_tcp).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.listen_tcp, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    let ws = match &config.listen_ws {
        Some(addr) => match TcpListener::bind(addr).await {
            Ok(l) => Some(l),
            Err(e) => {
                error!(addr = %addr, error = %e, "failed to bind");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let shutdown = CancellationToken::new();
    let heartbeat = HeartbeatEmitter::new(
        node.clone(),
        Arc::new(BalancerClient::new(config.balancer.clone(), config.rpc_timeout)),
        config.advertise.clone(),
        config.settings.heartbeat_interval,
        config.settings.missed_heartbeat_limit,
        config.backoff,
    );
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown.clone()));

    tokio::select! {
        result = node.clone().serve(tcp, ws) => {
            if let Err(e) = result {
                error!(error = %e, "proxy error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    node.shutdown(config.settings.cancel_grace * 4).await;
    shutdown.cancel();
    let _ = heartbeat_task.await;

    info!("ucrelay-proxy stopped");
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
