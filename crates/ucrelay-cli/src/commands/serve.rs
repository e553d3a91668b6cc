//! `ucrelay serve <server>`: a server that echoes every message back.

use super::Context;
use anyhow::{bail, Result};
use tracing::{info, warn};
use ucrelay_client::{Event, ServerEndpoint};
use ucrelay_core::ServerId;

pub async fn run(ctx: &Context, server: &str, count: Option<u64>) -> Result<()> {
    let server = ServerId::new(server)?;
    let endpoint = ServerEndpoint::new(ctx.balancer_client(), ctx.connect_config());
    let (placement, mut conn) = endpoint.register(&server).await?;
    eprintln!(
        "serving {server} on {} ({}); Ctrl+C to stop",
        placement.proxy_id, placement.address
    );

    let mut echoed = 0u64;
    loop {
        let event = tokio::select! {
            event = conn.next_event() => event,
            _ = tokio::signal::ctrl_c() => break,
        };
        match event {
            Some(Ok(Event::Message(frame))) => {
                info!(
                    from = %frame.sender(),
                    message_type = %frame.message_type(),
                    len = frame.header().payload_len,
                    "echo"
                );
                conn.send(frame.sender(), frame.message_type(), frame.payload())
                    .await?;
                echoed += 1;
                if count.is_some_and(|n| echoed >= n) {
                    break;
                }
            }
            Some(Ok(Event::Undeliverable(e))) => warn!(error = %e, "echo not delivered"),
            Some(Ok(Event::Closed(close))) => {
                bail!("proxy closed the channel: {:?} {}", close.reason, close.message)
            }
            Some(Err(e)) => return Err(e.into()),
            None => bail!("proxy connection ended"),
        }
    }

    conn.close().await?;
    eprintln!("echoed {echoed} message(s)");
    Ok(())
}
