//! `ucrelay register` / `ucrelay resolve` / `ucrelay proxies`.

use super::Context;
use anyhow::{Context as _, Result};
use ucrelay_core::ServerId;

pub async fn run_register(ctx: &Context, server: &str) -> Result<()> {
    let server = ServerId::new(server)?;
    let placement = ctx
        .balancer_client()
        .register_server(&server)
        .await
        .with_context(|| format!("register {server}"))?;
    println!("{}", serde_json::to_string_pretty(&placement)?);
    Ok(())
}

pub async fn run_resolve(ctx: &Context, server: &str) -> Result<()> {
    let server = ServerId::new(server)?;
    let placement = ctx
        .balancer_client()
        .resolve_server(&server)
        .await
        .with_context(|| format!("resolve {server}"))?;
    println!("{}", serde_json::to_string_pretty(&placement)?);
    Ok(())
}

pub async fn run_proxies(ctx: &Context) -> Result<()> {
    let proxies = ctx
        .balancer_client()
        .list_proxies()
        .await
        .context("list proxies")?;

    println!("{:<20} {:<28} {:>6} {:>10}", "PROXY", "ADDRESS", "LOAD", "EXPIRES");
    for p in &proxies {
        println!(
            "{:<20} {:<28} {:>6} {:>9}s",
            p.proxy_id,
            p.address,
            p.load,
            p.expires_in.as_secs()
        );
    }
    if proxies.is_empty() {
        println!("(no healthy proxies)");
    }
    Ok(())
}
