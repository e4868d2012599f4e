//! Liveness monitor: heartbeat probing and half-open connection eviction.
//!
//! Every tick the monitor walks a snapshot of the registry:
//!
//! 1. A connection still waiting on the previous tick's probe is considered
//!    dead. It is unregistered, its transport closed, and a
//!    [`CloseReason::Timeout`] notification emitted.
//! 2. Every other connection is sent a fresh `ping` frame and marked as
//!    awaiting its `pong`.
//!
//! A `pong` from the peer clears the mark via [`LivenessMonitor::acknowledge`].
//! Because probing is transport-level, a connection that is idle at the
//! application layer but still answering pings is never evicted. A silent
//! connection is evicted exactly one tick interval after its unanswered probe.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::LivenessConfig;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::events::CloseReason;
use crate::frame::Frame;
use crate::registry::{Connection, ConnectionId, Registry};
use crate::transport::TransportError;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Connections sent a fresh probe.
    pub probed: Vec<ConnectionId>,
    /// Connections evicted for leaving the previous probe unanswered.
    pub timed_out: Vec<ConnectionId>,
    /// Connections evicted because the probe itself could not be sent.
    pub failed: Vec<ConnectionId>,
}

enum ProbeOutcome {
    Sent(ConnectionId),
    Failed(ConnectionId),
    Skipped,
}

/// Periodically probes registered connections and evicts unresponsive ones.
pub struct LivenessMonitor {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    config: LivenessConfig,
    sequence: AtomicU64,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<Registry>, dispatcher: Arc<Dispatcher>, config: LivenessConfig) -> Self {
        Self {
            registry,
            dispatcher,
            config,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Records a probe acknowledgment from `id`.
    ///
    /// Returns `true` if a probe was outstanding. Acks from unknown
    /// connections, or unsolicited acks, are ignored.
    pub fn acknowledge(&self, id: ConnectionId) -> bool {
        let Ok(connection) = self.registry.lookup(id) else {
            trace!(connection = %id, "pong from unregistered connection");
            return false;
        };
        let acknowledged = connection.acknowledge_probe();
        trace!(connection = %id, acknowledged, "pong received");
        acknowledged
    }

    /// Runs one liveness pass.
    ///
    /// Evictions and probe sends for different connections run concurrently;
    /// each probe send is bounded by `probe_timeout`, so a stalled transport
    /// cannot hold up the pass.
    pub async fn tick(&self) -> TickReport {
        let (stale, healthy): (Vec<_>, Vec<_>) = self
            .registry
            .snapshot()
            .into_iter()
            .partition(|connection| !connection.is_alive());

        let evictions = stale.iter().map(|connection| async move {
            let id = connection.id();
            let error = GatewayError::ProbeTimeout(id);
            warn!(connection = %id, %error, "evicting");
            self.dispatcher
                .disconnect(id, CloseReason::Timeout)
                .await
                .then_some(id)
        });
        let probes = healthy.iter().map(|connection| self.probe(connection));

        let (evicted, probed) = futures::join!(join_all(evictions), join_all(probes));

        let mut report = TickReport {
            timed_out: evicted.into_iter().flatten().collect(),
            ..TickReport::default()
        };
        for outcome in probed {
            match outcome {
                ProbeOutcome::Sent(id) => report.probed.push(id),
                ProbeOutcome::Failed(id) => report.failed.push(id),
                ProbeOutcome::Skipped => {}
            }
        }
        report
    }

    async fn probe(&self, connection: &Arc<Connection>) -> ProbeOutcome {
        let id = connection.id();
        if !connection.begin_probe() {
            return ProbeOutcome::Skipped;
        }

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let ping = Frame::Ping(Bytes::copy_from_slice(&seq.to_be_bytes()));

        let error = match timeout(self.config.probe_timeout, connection.send(ping)).await {
            Ok(Ok(())) => {
                trace!(connection = %id, seq, "probe sent");
                return ProbeOutcome::Sent(id);
            }
            Ok(Err(e)) => GatewayError::Transport(e),
            Err(_) => GatewayError::Transport(TransportError::Timeout),
        };

        warn!(connection = %id, %error, "liveness probe could not be sent, evicting");
        if self.dispatcher.disconnect(id, CloseReason::Error).await {
            ProbeOutcome::Failed(id)
        } else {
            ProbeOutcome::Skipped
        }
    }

    /// Spawns the recurring tick task.
    ///
    /// The first tick fires one interval after spawning. Cancelling `shutdown`
    /// stops future ticks and abandons an in-flight pass without waiting for
    /// its probes to finish.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.tick_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?period, "liveness monitor started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    report = self.tick() => {
                        debug!(
                            probed = report.probed.len(),
                            timed_out = report.timed_out.len(),
                            failed = report.failed.len(),
                            "liveness tick"
                        );
                    }
                }
            }

            info!("liveness monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::{broadcast, mpsc};

    use crate::events::{EventBus, GatewayEvent};
    use crate::transport::{BoxFuture, ChannelTransport, Transport, TransportError};

    struct StalledTransport;

    impl Transport for StalledTransport {
        fn send(&self, _frame: Frame) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(std::future::pending())
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    struct Fixture {
        registry: Arc<Registry>,
        monitor: Arc<LivenessMonitor>,
        events: broadcast::Receiver<GatewayEvent>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new());
        let bus = EventBus::new(64);
        let events = bus.subscribe();
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), bus));
        let config = LivenessConfig {
            tick_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        };
        let monitor = Arc::new(LivenessMonitor::new(Arc::clone(&registry), dispatcher, config));
        Fixture {
            registry,
            monitor,
            events,
        }
    }

    fn connect(registry: &Registry) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (transport, rx) = ChannelTransport::pair(16);
        (registry.register(transport), rx)
    }

    #[tokio::test]
    async fn silent_connection_evicted_on_following_tick() {
        let mut fx = fixture();
        let (id, mut rx) = connect(&fx.registry);

        let first = fx.monitor.tick().await;
        assert_eq!(first.probed, vec![id]);
        assert!(first.timed_out.is_empty());
        assert!(matches!(rx.recv().await, Some(Frame::Ping(_))));

        let second = fx.monitor.tick().await;
        assert_eq!(second.timed_out, vec![id]);
        assert!(!fx.registry.contains(id));
        assert_eq!(rx.recv().await, Some(Frame::Close));
        assert_eq!(
            fx.events.try_recv().unwrap(),
            GatewayEvent::ConnectionClosed { id, reason: CloseReason::Timeout }
        );
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn responsive_connection_never_evicted() {
        let fx = fixture();
        let (id, mut rx) = connect(&fx.registry);

        for _ in 0..200 {
            let report = fx.monitor.tick().await;
            assert_eq!(report.probed, vec![id]);
            assert!(report.timed_out.is_empty());
            assert!(matches!(rx.recv().await, Some(Frame::Ping(_))));
            assert!(fx.monitor.acknowledge(id));
        }
        assert!(fx.registry.contains(id));
    }

    #[tokio::test]
    async fn ack_protects_until_next_unanswered_probe() {
        let fx = fixture();
        let (id, _rx) = connect(&fx.registry);

        fx.monitor.tick().await;
        fx.monitor.acknowledge(id);

        let second = fx.monitor.tick().await;
        assert_eq!(second.probed, vec![id]);
        assert!(fx.registry.contains(id));

        let third = fx.monitor.tick().await;
        assert_eq!(third.timed_out, vec![id]);
    }

    #[tokio::test]
    async fn unsolicited_ack_is_ignored() {
        let fx = fixture();
        let (id, _rx) = connect(&fx.registry);
        assert!(!fx.monitor.acknowledge(id));
        assert!(!fx.monitor.acknowledge(ConnectionId::from(404)));
    }

    #[tokio::test]
    async fn failed_probe_send_evicts_with_error() {
        let mut fx = fixture();
        let (id, rx) = connect(&fx.registry);
        drop(rx);

        let report = fx.monitor.tick().await;
        assert_eq!(report.failed, vec![id]);
        assert!(!fx.registry.contains(id));
        assert_eq!(
            fx.events.try_recv().unwrap(),
            GatewayEvent::ConnectionClosed { id, reason: CloseReason::Error }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transport_does_not_block_others() {
        let fx = fixture();
        let stalled = fx.registry.register(StalledTransport);
        let (healthy, mut rx) = connect(&fx.registry);

        let report = fx.monitor.tick().await;
        assert_eq!(report.probed, vec![healthy]);
        assert_eq!(report.failed, vec![stalled]);
        assert!(matches!(rx.recv().await, Some(Frame::Ping(_))));
        assert!(fx.registry.contains(healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_evicts_one_interval_after_probe() {
        let mut fx = fixture();
        let (id, mut rx) = connect(&fx.registry);
        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&fx.monitor).spawn(shutdown.clone());

        let started = Instant::now();
        assert!(matches!(rx.recv().await, Some(Frame::Ping(_))));
        let probed_at = Instant::now();
        assert_eq!(probed_at - started, Duration::from_secs(30));

        let event = fx.events.recv().await.unwrap();
        assert_eq!(event, GatewayEvent::ConnectionClosed { id, reason: CloseReason::Timeout });
        assert_eq!(Instant::now() - probed_at, Duration::from_secs(30));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_future_ticks() {
        let fx = fixture();
        let (_id, mut rx) = connect(&fx.registry);
        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&fx.monitor).spawn(shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(rx.try_recv().is_err());
    }
}
