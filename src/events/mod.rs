//! Notification surface: what the gateway and the client tell their callers.
//!
//! Notifications are fanned out over a Tokio broadcast channel so any number of
//! observers can follow connection lifecycle and reconnection progress. A
//! notification emitted with no subscribers is simply dropped.

use std::fmt;

use tokio::sync::broadcast;
use tracing::trace;

use crate::registry::ConnectionId;

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Explicit close by either side.
    Normal,
    /// The connection failed to acknowledge a liveness probe.
    Timeout,
    /// The transport reported an error.
    Error,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "normal",
            Self::Timeout => "timeout",
            Self::Error => "error",
        })
    }
}

/// Server-side lifecycle and delivery notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    ConnectionOpened {
        id: ConnectionId,
    },
    ConnectionClosed {
        id: ConnectionId,
        reason: CloseReason,
    },
    /// A broadcast or emit-to-all could not reach one recipient.
    DeliveryFailed {
        id: ConnectionId,
        event: String,
        error: String,
    },
}

/// A cloneable handle for emitting notifications of type `E`.
#[derive(Debug, Clone)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E> EventBus<E>
where
    E: Clone + fmt::Debug + Send + 'static,
{
    /// Creates a bus retaining up to `capacity` undelivered notifications per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to every notification emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: E) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            trace!(?event, "notification dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
