//! `ucrelay token <id>`: mint an HMAC credential for the proxy's `hmac` auth mode.

use anyhow::{Context, Result};
use ucrelay_core::{create_token, generate_secret};

pub fn run(id: &str, secret_hex: Option<&str>, ttl_secs: u64) -> Result<()> {
    let secret = match secret_hex {
        Some(hex_str) => hex::decode(hex_str.trim()).context("secret is not valid hex")?,
        None => {
            let secret = generate_secret();
            eprintln!("secret_hex = \"{}\"", hex::encode(&secret));
            secret
        }
    };
    println!("{}", create_token(&secret, id, ttl_secs));
    Ok(())
}
