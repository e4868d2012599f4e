//! # rtgate
//!
//! An async real-time messaging gateway written in Rust.
//!
//! Clients hold long-lived bidirectional links to the gateway. The gateway
//! tracks every link in a registry, routes named events to handlers, fans
//! messages out to all peers, and evicts peers that stop answering liveness
//! probes. The client side reconnects with exponential backoff.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rtgate::{Gateway, GatewayConfig, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Arc::new(Gateway::new(GatewayConfig::default())?);
//!     let echo = Arc::clone(&gateway);
//!     gateway.on("echo", move |from, message| {
//!         let gateway = Arc::clone(&echo);
//!         tokio::spawn(async move {
//!             let _ = gateway.send(from, &message).await;
//!         });
//!     });
//!
//!     let server = Server::bind("127.0.0.1:9000").await?;
//!     server.run(gateway, CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

// ── Wire level ────────────────────────────────────────────────────────────────
pub mod frame;
pub mod message;
pub mod transport;

// ── Gateway core ──────────────────────────────────────────────────────────────
pub mod dispatch;
pub mod events;
pub mod gateway;
pub mod liveness;
pub mod registry;

// ── Endpoints ─────────────────────────────────────────────────────────────────
pub mod client;
pub mod reconnect;
pub mod server;

// ── Ambient ───────────────────────────────────────────────────────────────────
pub mod config;
pub mod error;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use client::{Client, Connector, TcpConnector};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use events::{CloseReason, GatewayEvent};
pub use frame::Frame;
pub use gateway::Gateway;
pub use message::{Message, Payload};
pub use reconnect::{ConnectionState, ReconnectPolicy};
pub use registry::ConnectionId;
pub use server::{Server, ServerError};
pub use transport::Transport;
