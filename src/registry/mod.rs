//! Connection registry: the set of live connections, keyed by identifier.
//!
//! All mutations serialize through a single [`RwLock`]. Readers that need to
//! walk the whole set take a snapshot of `Arc<Connection>` handles under the
//! read lock and iterate after releasing it, so a pass never observes a
//! registration or removal that happens mid-iteration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::error::GatewayError;
use crate::frame::Frame;
use crate::transport::{Transport, TransportError};

/// Unique identifier assigned to a connection at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Liveness probe bookkeeping for one connection.
///
/// At most one probe is outstanding at a time: [`begin`](Self::begin) refuses
/// to start a second probe until the first is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeState {
    pub awaiting_pong: bool,
    pub last_probe_at: Option<Instant>,
}

impl ProbeState {
    fn begin(&mut self, now: Instant) -> bool {
        if self.awaiting_pong {
            return false;
        }
        self.awaiting_pong = true;
        self.last_probe_at = Some(now);
        true
    }

    fn acknowledge(&mut self) -> bool {
        std::mem::replace(&mut self.awaiting_pong, false)
    }
}

/// A registered connection.
pub struct Connection {
    id: ConnectionId,
    transport: Box<dyn Transport>,
    opened_at: Instant,
    last_activity: Mutex<Instant>,
    probe: Mutex<ProbeState>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// `false` while a liveness probe is unanswered.
    pub fn is_alive(&self) -> bool {
        !self.probe.lock().awaiting_pong
    }

    pub fn probe_state(&self) -> ProbeState {
        *self.probe.lock()
    }

    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.transport.send(frame).await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    // Only the liveness monitor drives these two.
    pub(crate) fn begin_probe(&self) -> bool {
        self.probe.lock().begin(Instant::now())
    }

    pub(crate) fn acknowledge_probe(&self) -> bool {
        self.probe.lock().acknowledge()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("opened_at", &self.opened_at)
            .field("probe", &self.probe_state())
            .finish_non_exhaustive()
    }
}

/// The set of currently registered connections.
///
/// # Examples
///
/// ```
/// use rtgate::registry::Registry;
/// use rtgate::transport::ChannelTransport;
///
/// let registry = Registry::new();
/// let (transport, _rx) = ChannelTransport::pair(8);
/// let id = registry.register(transport);
///
/// assert!(registry.lookup(id).is_ok());
/// assert!(registry.unregister(id).is_some());
/// assert!(registry.lookup(id).is_err());
/// ```
#[derive(Debug, Default)]
pub struct Registry {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `transport` and returns the new connection's id.
    pub fn register<T: Transport>(&self, transport: T) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let now = Instant::now();
        let connection = Arc::new(Connection {
            id,
            transport: Box::new(transport),
            opened_at: now,
            last_activity: Mutex::new(now),
            probe: Mutex::new(ProbeState::default()),
        });
        self.connections.write().insert(id, connection);
        debug!(connection = %id, "connection registered");
        id
    }

    /// Removes the connection, returning it if it was registered.
    ///
    /// Exactly one caller wins when several race to remove the same id.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(&id);
        if removed.is_some() {
            debug!(connection = %id, "connection unregistered");
        }
        removed
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionNotFound`] when `id` is not registered.
    pub fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection>, GatewayError> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(GatewayError::ConnectionNotFound(id))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    /// Returns the registered connections as of this instant, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self.connections.read().values().cloned().collect();
        connections.sort_by_key(|c| c.id);
        connections
    }

    /// Visits a snapshot of the registered connections.
    ///
    /// The visitor runs without the lock held, so it may freely register or
    /// unregister connections; those changes are not seen by this pass.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for connection in self.snapshot() {
            visitor(&connection);
        }
    }

    /// Records inbound activity on `id`. Unknown ids are ignored.
    pub fn touch(&self, id: ConnectionId) {
        if let Some(connection) = self.connections.read().get(&id) {
            connection.touch();
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
