//! ucrelay: command-line tool for the relay layer.
//!
//! Places and resolves servers through the balancer, lists proxies, runs an
//! echo server, sends messages as a client and mints HMAC credentials.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use tracing::error;

/// ucrelay: relay layer CLI
#[derive(Parser)]
#[command(name = "ucrelay", version, about = "ucrelay CLI: register, resolve, serve, send")]
struct Cli {
    /// Balancer address (host:port)
    #[arg(short, long, global = true)]
    balancer: Option<String>,

    /// Credential presented to the proxy
    #[arg(long, global = true)]
    credential: Option<String>,

    /// Config file path
    #[arg(long, global = true, default_value = "~/.ucrelay/cli.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Place a server on a proxy and print the placement
    Register {
        server: String,
    },

    /// Print the proxy currently hosting a server
    Resolve {
        server: String,
    },

    /// List healthy proxies with their load
    Proxies,

    /// Register a server and echo every message back to its sender
    Serve {
        server: String,

        /// Stop after this many messages
        #[arg(long)]
        count: Option<u64>,
    },

    /// Send one message to a server as a client
    Send {
        /// Client id to connect as
        #[arg(long, default_value = "ucrelay-cli")]
        from: String,

        server: String,

        /// Application message type (below 0xFF00)
        #[arg(short = 't', long = "type", default_value_t = 1)]
        message_type: u16,

        /// Payload (UTF-8 text unless --hex)
        payload: String,

        /// Treat the payload as hex
        #[arg(long)]
        hex: bool,

        /// Wait this many milliseconds for a reply (0 = don't wait)
        #[arg(long, default_value_t = 2_000)]
        wait_ms: u64,
    },

    /// Mint an HMAC credential for an id
    Token {
        id: String,

        /// Shared secret (hex); generated and printed when omitted
        #[arg(long)]
        secret_hex: Option<String>,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 3_600)]
        ttl_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("ucrelay_cli=debug,ucrelay_client=debug,ucrelay_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("ucrelay_cli=warn,ucrelay_client=warn")
            .with_target(false)
            .init();
    }

    let cfg = match config::Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ucrelay: {e:#}");
            std::process::exit(1);
        }
    };
    let ctx = commands::Context {
        balancer: cli.balancer.unwrap_or(cfg.default.balancer.clone()),
        credential: cli.credential.unwrap_or(cfg.default.credential.clone()),
        timeout: cfg.default.timeout(),
    };

    let result = match cli.command {
        Command::Register { server } => commands::placement::run_register(&ctx, &server).await,
        Command::Resolve { server } => commands::placement::run_resolve(&ctx, &server).await,
        Command::Proxies => commands::placement::run_proxies(&ctx).await,
        Command::Serve { server, count } => commands::serve::run(&ctx, &server, count).await,
        Command::Send {
            from,
            server,
            message_type,
            payload,
            hex,
            wait_ms,
        } => {
            let request = commands::send::Request {
                from,
                server,
                message_type,
                payload,
                hex,
                wait_ms,
            };
            commands::send::run(&ctx, request).await
        }
        Command::Token {
            id,
            secret_hex,
            ttl_secs,
        } => commands::token::run(&id, secret_hex.as_deref(), ttl_secs),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("ucrelay: {e:#}");
        std::process::exit(1);
    }
}
