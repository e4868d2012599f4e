//! Async TCP server using Tokio.
//!
//! Accepts TCP connections, registers each one with a [`Gateway`], and feeds
//! its frames to [`Gateway::handle_frame`] strictly in arrival order. Each
//! connection runs on its own task, so connections interleave freely.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::gateway::{Flow, Gateway};
use crate::registry::ConnectionId;
use crate::transport::tcp::{self, FrameReader, ReadError};
use crate::transport::TransportError;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// The rtgate TCP server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rtgate::config::GatewayConfig;
/// use rtgate::gateway::Gateway;
/// use rtgate::server::Server;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let gateway = Arc::new(Gateway::new(GatewayConfig::default())?);
///     let server = Server::bind("127.0.0.1:9000").await?;
///     server.run(gateway, CancellationToken::new()).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// The gateway's liveness monitor is started alongside the accept loop and
    /// stopped with it. Cancelling `shutdown` also ends every connection task.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, gateway: Arc<Gateway>, shutdown: CancellationToken) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "rtgate listening");
        let monitor = gateway.start_liveness(shutdown.child_token());

        loop {
            let (stream, peer_addr) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "connection accepted");
            if let Err(e) = stream.set_nodelay(true) {
                warn!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
            }
            spawn_connection(stream, peer_addr, Arc::clone(&gateway), shutdown.child_token());
        }

        info!("rtgate shutting down");
        let _ = monitor.await;
        Ok(())
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let config = gateway.config();
    let (transport, reader, writer) =
        tcp::split(stream, config.send_queue_capacity, config.max_frame_size);
    let id = gateway.accept(transport);
    debug!(peer = %peer_addr, connection = %id, "connection registered");

    tokio::spawn(handle_connection(reader, writer, id, gateway, shutdown))
}

/// Handles a single connection over its lifetime.
///
/// Frames are handled one at a time, in the order they arrive. The loop ends
/// when the peer closes, the frame stream turns malformed, the outbound side
/// is closed (for instance by a liveness eviction), or on shutdown.
async fn handle_connection(
    mut reader: FrameReader,
    mut writer: JoinHandle<()>,
    id: ConnectionId,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                gateway.peer_gone(id).await;
                break;
            }
            _ = &mut writer => {
                // Outbound side is gone; the gateway either evicted us already
                // or the socket failed on write.
                gateway
                    .fail(id, &GatewayError::Transport(TransportError::Closed))
                    .await;
                return;
            }
            next = reader.next_frame() => next,
        };

        match next {
            Ok(Some(frame)) => match gateway.handle_frame(id, frame).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Closed) => break,
                Err(e) if e.is_connection_fatal() => {
                    gateway.fail(id, &e).await;
                    break;
                }
                Err(e) => {
                    // Already evicted elsewhere, e.g. by the liveness monitor.
                    debug!(connection = %id, error = %e, "connection gone");
                    break;
                }
            },
            Ok(None) => {
                debug!(connection = %id, "connection closed by peer");
                gateway.peer_gone(id).await;
                break;
            }
            Err(ReadError::Io(e)) => {
                gateway.fail(id, &GatewayError::Transport(e.into())).await;
                break;
            }
            Err(ReadError::Frame(e)) => {
                gateway.fail(id, &GatewayError::Frame(e)).await;
                break;
            }
            Err(ReadError::UnexpectedEof) => {
                gateway
                    .fail(id, &GatewayError::Transport(TransportError::Closed))
                    .await;
                break;
            }
        }
    }

    // Let the writer flush the close frame queued by `disconnect`.
    let _ = writer.await;
}
