//! `ucrelay send <server> <payload>`: one message as a client.

use super::Context;
use anyhow::{bail, Context as _, Result};
use std::time::Duration;
use ucrelay_client::{ClientEndpoint, Event};
use ucrelay_core::{ClientId, ServerId};

pub struct Request {
    pub from: String,
    pub server: String,
    pub message_type: u16,
    pub payload: String,
    pub hex: bool,
    pub wait_ms: u64,
}

pub async fn run(ctx: &Context, req: Request) -> Result<()> {
    let server = ServerId::new(req.server.as_str())?;
    let payload = payload_bytes(&req.payload, req.hex)?;
    let client = ClientEndpoint::new(
        ClientId::new(req.from.as_str())?,
        ctx.balancer_client(),
        ctx.connect_config(),
    );
    let (placement, mut conn) = client
        .connect(&server)
        .await
        .with_context(|| format!("connect to {server}"))?;
    eprintln!("connected to {} via {}", server, placement.proxy_id);

    conn.send(server.as_str(), req.message_type, payload).await?;

    if req.wait_ms > 0 {
        let wait = Duration::from_millis(req.wait_ms);
        match tokio::time::timeout(wait, conn.next_event()).await {
            Err(_) => eprintln!("no reply within {wait:?}"),
            Ok(Some(Ok(Event::Message(frame)))) => {
                let reply = serde_json::json!({
                    "sender": frame.sender(),
                    "type": frame.message_type().0,
                    "payload": String::from_utf8_lossy(&frame.payload()),
                    "payload_hex": hex::encode(frame.payload()),
                });
                println!("{}", serde_json::to_string_pretty(&reply)?);
            }
            Ok(Some(Ok(Event::Undeliverable(e)))) => bail!("not delivered: {e}"),
            Ok(Some(Ok(Event::Closed(close)))) => {
                bail!("proxy closed the session: {:?} {}", close.reason, close.message)
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => bail!("proxy connection ended"),
        }
    }

    conn.close().await?;
    Ok(())
}

fn payload_bytes(payload: &str, is_hex: bool) -> Result<Vec<u8>> {
    if is_hex {
        hex::decode(payload.trim()).context("payload is not valid hex")
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::payload_bytes;

    #[test]
    fn payload_text_or_hex() {
        assert_eq!(payload_bytes("ping", false).unwrap(), b"ping");
        assert_eq!(payload_bytes("70696e67", true).unwrap(), b"ping");
        assert!(payload_bytes("zz", true).is_err());
    }
}
