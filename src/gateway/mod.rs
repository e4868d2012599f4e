//! The gateway instance: registry, dispatcher, liveness monitor and
//! notification bus, wired together once and passed by reference.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rtgate::config::GatewayConfig;
//! use rtgate::gateway::Gateway;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> Result<(), rtgate::GatewayError> {
//! let gateway = Arc::new(Gateway::new(GatewayConfig::default())?);
//! gateway.on("chat", |from, message| {
//!     tracing::info!(%from, event = message.event(), "chat message");
//! });
//! let shutdown = CancellationToken::new();
//! # let _ = shutdown;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::dispatch::{DeliveryReport, Dispatch, Dispatcher};
use crate::error::GatewayError;
use crate::events::{CloseReason, EventBus, GatewayEvent};
use crate::frame::Frame;
use crate::liveness::LivenessMonitor;
use crate::message::Message;
use crate::registry::{ConnectionId, Registry};
use crate::transport::Transport;

/// Whether a connection's read loop should keep going after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Closed,
}

/// A real-time messaging gateway.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<LivenessMonitor>,
    events: EventBus<GatewayEvent>,
}

impl Gateway {
    /// Builds a gateway from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when `config` fails validation.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;

        let registry = Arc::new(Registry::new());
        let events = EventBus::new(config.event_capacity);
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::clone(&registry), events.clone())
                .with_send_timeout(config.send_timeout)
                .with_max_frame_size(config.max_frame_size),
        );
        let monitor = Arc::new(LivenessMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            config.liveness,
        ));

        Ok(Self {
            config,
            registry,
            dispatcher,
            monitor,
            events,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn monitor(&self) -> &Arc<LivenessMonitor> {
        &self.monitor
    }

    /// Subscribes to connection lifecycle and delivery notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Starts the recurring liveness task. Cancel `shutdown` to stop it.
    pub fn start_liveness(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.monitor).spawn(shutdown)
    }

    /// Registers a connection whose handshake has completed.
    pub fn accept<T: Transport>(&self, transport: T) -> ConnectionId {
        let id = self.registry.register(transport);
        info!(connection = %id, "connection opened");
        self.events.emit(GatewayEvent::ConnectionOpened { id });
        id
    }

    /// Processes one inbound frame from `id`.
    ///
    /// Must be called in arrival order for a given connection. Control frames
    /// are answered here: `ping` is echoed as `pong`, `pong` acknowledges the
    /// liveness probe, `close` tears the connection down. Data frames go to the
    /// dispatcher; a malformed data frame is logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when answering a ping fails. The
    /// caller should then report the failure via [`Gateway::fail`].
    pub async fn handle_frame(&self, id: ConnectionId, frame: Frame) -> Result<Flow, GatewayError> {
        match frame {
            Frame::Ping(payload) => {
                let connection = self.registry.lookup(id)?;
                connection.touch();
                connection.send(Frame::Pong(payload)).await?;
            }
            Frame::Pong(_) => {
                self.registry.touch(id);
                self.monitor.acknowledge(id);
            }
            Frame::Close => {
                debug!(connection = %id, "close frame received");
                self.dispatcher.disconnect(id, CloseReason::Normal).await;
                return Ok(Flow::Closed);
            }
            data => match self.dispatcher.on_message(id, data) {
                Ok(Dispatch::Handled | Dispatch::Unhandled) => {}
                Err(e) => warn!(connection = %id, error = %e, "dropping malformed message"),
            },
        }
        Ok(Flow::Continue)
    }

    /// Closes `id` normally.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionNotFound`] when `id` is not registered.
    pub async fn close(&self, id: ConnectionId) -> Result<(), GatewayError> {
        if self.dispatcher.disconnect(id, CloseReason::Normal).await {
            Ok(())
        } else {
            Err(GatewayError::ConnectionNotFound(id))
        }
    }

    /// Evicts `id` after a transport failure. A no-op if already gone.
    pub async fn fail(&self, id: ConnectionId, error: &GatewayError) {
        if self.registry.contains(id) {
            warn!(connection = %id, %error, "connection failed");
        }
        self.dispatcher.disconnect(id, CloseReason::Error).await;
    }

    /// Records that the peer went away without a close frame.
    pub async fn peer_gone(&self, id: ConnectionId) {
        self.dispatcher.disconnect(id, CloseReason::Normal).await;
    }

    /// Registers a handler for `event`. See [`Dispatcher::on`].
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(ConnectionId, Message) + Send + Sync + 'static,
    {
        self.dispatcher.on(event, handler);
    }

    /// Deregisters the handler for `event`.
    pub fn off(&self, event: &str) -> bool {
        self.dispatcher.off(event)
    }

    /// Sends `message` to one connection. See [`Dispatcher::send`].
    pub async fn send(&self, to: ConnectionId, message: &Message) -> Result<(), GatewayError> {
        self.dispatcher.send(to, message).await
    }

    /// Delivers `message` to every connection except `exclude`.
    pub async fn broadcast(
        &self,
        message: &Message,
        exclude: Option<ConnectionId>,
    ) -> Result<DeliveryReport, GatewayError> {
        self.dispatcher.broadcast(message, exclude).await
    }

    /// Delivers `message` to every connection.
    pub async fn emit_all(&self, message: &Message) -> Result<DeliveryReport, GatewayError> {
        self.dispatcher.emit_all(message).await
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::transport::ChannelTransport;

    fn gateway() -> Gateway {
        Gateway::new(GatewayConfig::default()).unwrap()
    }

    fn connect(gateway: &Gateway) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (transport, rx) = ChannelTransport::pair(16);
        (gateway.accept(transport), rx)
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = GatewayConfig::default();
        config.reconnect.multiplier = 0.0;
        assert!(matches!(Gateway::new(config), Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn accept_announces_open() {
        let gateway = gateway();
        let mut events = gateway.subscribe();
        let (id, _rx) = connect(&gateway);
        assert_eq!(events.try_recv().unwrap(), GatewayEvent::ConnectionOpened { id });
        assert_eq!(gateway.connection_count(), 1);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let gateway = gateway();
        let (id, mut rx) = connect(&gateway);
        let payload = Bytes::from_static(b"abc");
        let flow = gateway.handle_frame(id, Frame::Ping(payload.clone())).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(rx.recv().await, Some(Frame::Pong(payload)));
    }

    #[tokio::test]
    async fn pong_acknowledges_probe() {
        let gateway = gateway();
        let (id, mut rx) = connect(&gateway);

        gateway.monitor().tick().await;
        let Some(Frame::Ping(seq)) = rx.recv().await else {
            panic!("expected a probe");
        };
        assert!(!gateway.registry().lookup(id).unwrap().is_alive());

        gateway.handle_frame(id, Frame::Pong(seq)).await.unwrap();
        assert!(gateway.registry().lookup(id).unwrap().is_alive());

        let report = gateway.monitor().tick().await;
        assert!(report.timed_out.is_empty());
    }

    #[tokio::test]
    async fn close_frame_ends_connection_normally() {
        let gateway = gateway();
        let (id, _rx) = connect(&gateway);
        let mut events = gateway.subscribe();

        let flow = gateway.handle_frame(id, Frame::Close).await.unwrap();
        assert_eq!(flow, Flow::Closed);
        assert_eq!(gateway.connection_count(), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            GatewayEvent::ConnectionClosed { id, reason: CloseReason::Normal }
        );
    }

    #[tokio::test]
    async fn malformed_data_frame_keeps_connection() {
        let gateway = gateway();
        let (id, _rx) = connect(&gateway);
        let flow = gateway
            .handle_frame(id, Frame::Text("{oops".into()))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(gateway.registry().contains(id));
    }

    #[tokio::test]
    async fn frames_from_one_connection_handled_in_order() {
        let gateway = gateway();
        let (id, _rx) = connect(&gateway);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        gateway.on("n", move |_, message| {
            if let Some(n) = message.payload().as_json().and_then(|v| v.as_u64()) {
                sink.lock().push(n);
            }
        });

        for n in 0..20u64 {
            let frame = Message::json("n", json!(n)).to_frame().unwrap();
            gateway.handle_frame(id, frame).await.unwrap();
        }
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn configured_frame_limit_applies_to_sends() {
        let mut config = GatewayConfig::default();
        config.max_frame_size = 32;
        let gateway = Gateway::new(config).unwrap();
        let (id, _rx) = connect(&gateway);

        let big = Message::binary("blob", vec![0u8; 64]);
        assert!(matches!(
            gateway.send(id, &big).await,
            Err(GatewayError::Frame(crate::frame::FrameError::TooLarge { .. }))
        ));
        assert!(gateway.registry().contains(id));
    }

    #[tokio::test]
    async fn explicit_close_of_unknown_connection_fails() {
        let gateway = gateway();
        assert!(matches!(
            gateway.close(ConnectionId::from(77)).await,
            Err(GatewayError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn fail_reports_error_reason_once() {
        let gateway = gateway();
        let (id, _rx) = connect(&gateway);
        let mut events = gateway.subscribe();

        let error = GatewayError::Transport(crate::transport::TransportError::Closed);
        gateway.fail(id, &error).await;
        gateway.fail(id, &error).await;

        assert_eq!(
            events.try_recv().unwrap(),
            GatewayEvent::ConnectionClosed { id, reason: CloseReason::Error }
        );
        assert!(events.try_recv().is_err());
    }
}
