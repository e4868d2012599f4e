//! Message dispatch: inbound frames to handlers, outbound messages to connections.
//!
//! Inbound, each decoded data frame is routed by its event name to the handler
//! registered with [`Dispatcher::on`]. Outbound, messages go to one connection
//! ([`Dispatcher::send`]), every connection but the sender
//! ([`Dispatcher::broadcast`]), or every connection ([`Dispatcher::emit_all`]).
//! Broadcast and emit-to-all are separate operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::events::{CloseReason, EventBus, GatewayEvent};
use crate::frame::{DEFAULT_MAX_FRAME_SIZE, Frame};
use crate::message::{Message, MessageError};
use crate::registry::{Connection, ConnectionId, Registry};
use crate::transport::TransportError;

/// A type-erased, reference-counted message handler.
///
/// Handlers run synchronously on the task reading the sender's connection, in
/// frame arrival order. Long-running work should be handed off to a spawned
/// task.
pub type Handler = Arc<dyn Fn(ConnectionId, Message) + Send + Sync + 'static>;

/// Outcome of routing one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler was registered for the event and has run.
    Handled,
    /// No handler is registered for the event; the message was dropped.
    Unhandled,
}

/// Per-recipient results of a fan-out delivery.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, TransportError)>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Default bound on a single outbound send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Routes messages between handlers and registered connections.
pub struct Dispatcher {
    registry: Arc<Registry>,
    handlers: RwLock<HashMap<String, Handler>>,
    events: EventBus<GatewayEvent>,
    send_timeout: Duration,
    max_frame_size: usize,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, events: EventBus<GatewayEvent>) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
            events,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Bounds each outbound send; a recipient that cannot take the frame in
    /// time fails with [`TransportError::Timeout`].
    #[must_use]
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Largest outbound frame payload accepted by `send` and the fan-outs.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Registers `handler` for `event`, replacing any previous handler.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use rtgate::dispatch::Dispatcher;
    /// use rtgate::events::EventBus;
    /// use rtgate::registry::Registry;
    ///
    /// let dispatcher = Dispatcher::new(Arc::new(Registry::new()), EventBus::new(16));
    /// dispatcher.on("chat", |from, message| {
    ///     println!("{from}: {:?}", message.payload());
    /// });
    /// assert!(dispatcher.off("chat"));
    /// ```
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(ConnectionId, Message) + Send + Sync + 'static,
    {
        let event = event.into();
        debug!(%event, "handler registered");
        self.handlers.write().insert(event, Arc::new(handler));
    }

    /// Deregisters the handler for `event`. Returns `true` if one was present.
    pub fn off(&self, event: &str) -> bool {
        self.handlers.write().remove(event).is_some()
    }

    pub fn has_handler(&self, event: &str) -> bool {
        self.handlers.read().contains_key(event)
    }

    /// Decodes an inbound data frame from `from` and runs its handler.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] when the frame cannot be decoded. An unknown
    /// event name is not an error: it yields [`Dispatch::Unhandled`].
    pub fn on_message(&self, from: ConnectionId, frame: Frame) -> Result<Dispatch, MessageError> {
        let message = Message::from_frame(frame)?;
        self.registry.touch(from);

        // Clone the handler out so it runs without the table locked.
        let handler = self.handlers.read().get(message.event()).cloned();
        match handler {
            Some(handler) => {
                handler(from, message);
                Ok(Dispatch::Handled)
            }
            None => {
                debug!(connection = %from, event = message.event(), "no handler for event, dropping");
                Ok(Dispatch::Unhandled)
            }
        }
    }

    /// Sends `message` to one connection.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ConnectionNotFound`]: `to` is not registered.
    /// - [`GatewayError::Transport`]: the underlying send failed or timed out.
    /// - [`GatewayError::Message`]: the message could not be encoded.
    /// - [`GatewayError::Frame`]: the encoded frame exceeds the size limit.
    pub async fn send(&self, to: ConnectionId, message: &Message) -> Result<(), GatewayError> {
        let connection = self.registry.lookup(to)?;
        let frame = self.encode(message)?;
        self.deliver(&connection, frame).await?;
        Ok(())
    }

    fn encode(&self, message: &Message) -> Result<Frame, GatewayError> {
        let frame = message.to_frame()?;
        frame.check_size(self.max_frame_size)?;
        Ok(frame)
    }

    async fn deliver(&self, connection: &Connection, frame: Frame) -> Result<(), TransportError> {
        timeout(self.send_timeout, connection.send(frame))
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    /// Delivers `message` to every registered connection except `exclude`.
    ///
    /// Delivery is best-effort: a failure on one recipient is logged, reported
    /// once as [`GatewayEvent::DeliveryFailed`], and does not stop delivery to
    /// the others.
    ///
    /// # Errors
    ///
    /// Only an unencodable or oversized message fails the whole call.
    pub async fn broadcast(
        &self,
        message: &Message,
        exclude: Option<ConnectionId>,
    ) -> Result<DeliveryReport, GatewayError> {
        let recipients = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|c| Some(c.id()) != exclude)
            .collect();
        self.fan_out(message, recipients).await
    }

    /// Delivers `message` to every registered connection, sender included.
    pub async fn emit_all(&self, message: &Message) -> Result<DeliveryReport, GatewayError> {
        self.fan_out(message, self.registry.snapshot()).await
    }

    async fn fan_out(
        &self,
        message: &Message,
        recipients: Vec<Arc<Connection>>,
    ) -> Result<DeliveryReport, GatewayError> {
        let frame = self.encode(message)?;
        let sends = recipients.iter().map(|connection| {
            let frame = frame.clone();
            async move { (connection.id(), self.deliver(connection, frame).await) }
        });

        let mut report = DeliveryReport::default();
        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered.push(id),
                Err(e) => {
                    warn!(connection = %id, event = message.event(), error = %e, "delivery failed");
                    self.events.emit(GatewayEvent::DeliveryFailed {
                        id,
                        event: message.event().to_owned(),
                        error: e.to_string(),
                    });
                    report.failed.push((id, e));
                }
            }
        }

        debug!(
            event = message.event(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "fan-out complete"
        );
        Ok(report)
    }

    /// Removes, closes and announces a connection.
    ///
    /// This is the single exit path for connections: whichever caller removes
    /// the id first closes the transport and emits the one
    /// [`GatewayEvent::ConnectionClosed`]. Later calls return `false`.
    pub async fn disconnect(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let Some(connection) = self.registry.unregister(id) else {
            return false;
        };
        connection.close().await;
        info!(connection = %id, %reason, "connection closed");
        self.events.emit(GatewayEvent::ConnectionClosed { id, reason });
        true
    }
}
