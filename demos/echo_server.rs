//! Echo and chat demo for rtgate.
//!
//! Run with:
//!
//! ```text
//! RUST_LOG=rtgate=debug cargo run --example echo_server -- [config.toml]
//! ```
//!
//! `echo` events are sent back to the sender, `chat` events are broadcast to
//! every other connection. Ctrl-C shuts the server down.

use std::sync::Arc;

use rtgate::{Gateway, GatewayConfig, GatewayEvent, Server};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    let gateway = Arc::new(Gateway::new(config)?);

    let echo = Arc::clone(&gateway);
    gateway.on("echo", move |from, message| {
        let gateway = Arc::clone(&echo);
        tokio::spawn(async move {
            if let Err(e) = gateway.send(from, &message).await {
                tracing::warn!(connection = %from, error = %e, "echo failed");
            }
        });
    });

    let chat = Arc::clone(&gateway);
    gateway.on("chat", move |from, message| {
        let gateway = Arc::clone(&chat);
        tokio::spawn(async move {
            if let Ok(report) = gateway.broadcast(&message, Some(from)).await {
                info!(delivered = report.delivered.len(), failed = report.failed.len(), "chat relayed");
            }
        });
    });

    let mut events = gateway.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                GatewayEvent::ConnectionOpened { id } => info!(connection = %id, "joined"),
                GatewayEvent::ConnectionClosed { id, reason } => info!(connection = %id, %reason, "left"),
                GatewayEvent::DeliveryFailed { id, event, error } => {
                    info!(connection = %id, %event, %error, "delivery failed")
                }
            }
        }
    });

    let server = Server::bind("127.0.0.1:9000").await?;
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    server.run(gateway, shutdown).await?;
    Ok(())
}
