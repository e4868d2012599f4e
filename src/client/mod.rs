//! Reconnecting client.
//!
//! [`Client`] drives a [`ReconnectController`] against a [`Connector`]: it
//! attempts a connection, holds it until it drops, and retries with backoff
//! until the attempt budget runs out or it is shut down. The backoff wait is
//! cancellable: shutdown or [`Client::reconnect_now`] ends it early, and only
//! one attempt is ever in flight.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Notify, broadcast, oneshot};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::events::{CloseReason, EventBus};
use crate::frame::Frame;
use crate::message::Message;
use crate::reconnect::{ConnectionState, ReconnectController, ReconnectEvent, ReconnectPolicy, Retry};
use crate::transport::tcp;
use crate::transport::{BoxFuture, Transport, TransportError};

/// An established link: the outbound transport plus a signal that fires once
/// when the link is lost.
pub struct Session {
    pub transport: Arc<dyn Transport>,
    pub closed: oneshot::Receiver<CloseReason>,
}

/// Opens links to a remote gateway.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Session, TransportError>>;
}

/// Handler for messages arriving on a client link.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync + 'static>;

/// Connects over TCP using the length-prefixed framing.
///
/// Pings from the server are answered automatically; data frames are decoded
/// and passed to the handler set with [`TcpConnector::on_message`].
pub struct TcpConnector {
    addr: SocketAddr,
    max_frame_size: usize,
    queue_capacity: usize,
    handler: Option<MessageHandler>,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            max_frame_size: crate::frame::DEFAULT_MAX_FRAME_SIZE,
            queue_capacity: 256,
            handler: None,
        }
    }

    #[must_use]
    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    #[must_use]
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Session, TransportError>> {
        Box::pin(async move {
            let stream = TcpStream::connect(self.addr).await?;
            stream.set_nodelay(true)?;
            let (transport, mut reader, mut writer) =
                tcp::split(stream, self.queue_capacity, self.max_frame_size);
            let transport: Arc<dyn Transport> = Arc::new(transport);
            let (closed_tx, closed) = oneshot::channel();

            let link = Arc::clone(&transport);
            let handler = self.handler.clone();
            tokio::spawn(async move {
                let reason = loop {
                    let next = tokio::select! {
                        biased;
                        _ = &mut writer => break CloseReason::Error,
                        next = reader.next_frame() => next,
                    };
                    match next {
                        Ok(Some(Frame::Ping(payload))) => {
                            if link.send(Frame::Pong(payload)).await.is_err() {
                                break CloseReason::Error;
                            }
                        }
                        Ok(Some(Frame::Pong(_))) => {}
                        Ok(Some(Frame::Close)) | Ok(None) => break CloseReason::Normal,
                        Ok(Some(data)) => match Message::from_frame(data) {
                            Ok(message) => {
                                if let Some(handler) = &handler {
                                    handler(message);
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping malformed message"),
                        },
                        Err(e) => {
                            debug!(error = %e, "link read failed");
                            break CloseReason::Error;
                        }
                    }
                };
                link.close().await;
                let _ = closed_tx.send(reason);
            });

            Ok(Session { transport, closed })
        })
    }
}

/// A client that keeps a link to a gateway alive.
pub struct Client<C> {
    connector: C,
    controller: Mutex<ReconnectController>,
    current: Mutex<Option<Arc<dyn Transport>>>,
    wake: Notify,
    running: tokio::sync::Mutex<()>,
    events: EventBus<ReconnectEvent>,
}

impl<C: Connector> Client<C> {
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when `policy` fails validation.
    pub fn new(connector: C, policy: ReconnectPolicy) -> Result<Self, GatewayError> {
        Self::with_event_capacity(connector, policy, 256)
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when `policy` fails validation.
    pub fn with_event_capacity(
        connector: C,
        policy: ReconnectPolicy,
        capacity: usize,
    ) -> Result<Self, GatewayError> {
        policy.validate()?;
        let events = EventBus::new(capacity);
        Ok(Self {
            connector,
            controller: Mutex::new(ReconnectController::new(policy, events.clone())),
            current: Mutex::new(None),
            wake: Notify::new(),
            running: tokio::sync::Mutex::new(()),
            events,
        })
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.controller.lock().state()
    }

    pub fn attempts(&self) -> u32 {
        self.controller.lock().attempts()
    }

    /// Ends a pending backoff wait so the next attempt starts immediately.
    ///
    /// Has no effect unless [`run`](Self::run) is currently waiting out a
    /// backoff.
    pub fn reconnect_now(&self) {
        self.wake.notify_waiters();
    }

    /// Leaves `Exhausted` so [`run`](Self::run) may be called again.
    pub fn reset(&self) -> bool {
        self.controller.lock().reset()
    }

    /// Sends `message` over the current link.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when not connected, when the send
    /// fails, or when the frame exceeds the connector's size limit.
    pub async fn send(&self, message: &Message) -> Result<(), GatewayError> {
        let frame = message.to_frame()?;
        let transport = self.current.lock().clone().ok_or(TransportError::Closed)?;
        transport.send(frame).await?;
        Ok(())
    }

    /// Connects and stays connected until `shutdown` is cancelled.
    ///
    /// Returns `Ok(())` on shutdown. A second concurrent call returns
    /// immediately without attempting anything.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ReconnectExhausted`] once the policy's attempt
    /// budget is spent; call [`reset`](Self::reset) before running again.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        let Ok(_running) = self.running.try_lock() else {
            warn!("client is already running");
            return Ok(());
        };

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            self.controller.lock().begin_attempt()?;

            let attempt = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.abandon_attempt();
                    return Ok(());
                }
                attempt = self.connector.connect() => attempt,
            };

            match attempt {
                Ok(session) => {
                    let opened_at = Instant::now();
                    let reason = self.hold(session, &shutdown).await;
                    let Some(reason) = reason else {
                        return Ok(());
                    };
                    info!(%reason, "link lost, reconnecting");

                    // A link that drops straight after connecting would
                    // otherwise be redialled in a tight loop.
                    let base_delay = self.controller.lock().policy().base_delay;
                    if opened_at.elapsed() < base_delay && !self.back_off(base_delay, &shutdown).await {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "connection attempt failed");
                    let retry = self.controller.lock().on_failure();
                    match retry {
                        Some(Retry::After(delay)) => {
                            if !self.back_off(delay, &shutdown).await {
                                return Ok(());
                            }
                        }
                        Some(Retry::Exhausted) => {
                            let attempts = self.controller.lock().attempts();
                            return Err(GatewayError::ReconnectExhausted { attempts });
                        }
                        None => {}
                    }
                }
            }
        }
    }

    // Holds an established session until it drops (`Some(reason)`) or
    // shutdown is requested (`None`).
    async fn hold(&self, session: Session, shutdown: &CancellationToken) -> Option<CloseReason> {
        let Session { transport, closed } = session;
        // Publish the link before announcing it so subscribers can send.
        *self.current.lock() = Some(Arc::clone(&transport));
        self.controller.lock().on_connected();

        let reason = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            reason = closed => Some(reason.unwrap_or(CloseReason::Error)),
        };

        self.current.lock().take();
        transport.close().await;
        self.controller.lock().on_disconnected();
        reason
    }

    // Waits out `delay` unless woken early. Returns `false` on shutdown.
    async fn back_off(&self, delay: Duration, shutdown: &CancellationToken) -> bool {
        debug!(?delay, "waiting before next attempt");
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = self.wake.notified() => {
                debug!("manual reconnect, skipping backoff");
                true
            }
            _ = sleep(delay) => true,
        }
    }

    // An attempt cancelled by shutdown counts as neither success nor failure.
    fn abandon_attempt(&self) {
        self.controller.lock().cancel_attempt();
    }
}
