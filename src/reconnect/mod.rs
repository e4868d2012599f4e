//! Reconnection controller: the client-side connection state machine.
//!
//! ```text
//!                 success                  transport error / remote close
//!  Connecting ─────────────▶ Connected ──────────────────────────────┐
//!     ▲   │                                                          │
//!     │   │ failure (attempts += 1, wait backoff)                    │
//!     │   ▼                                                          ▼
//!     └── Disconnected ◀─────────────────────────────────────────────┘
//!             │
//!             │ attempts ≥ max_attempts
//!             ▼
//!         Exhausted  (terminal until reset)
//! ```
//!
//! The controller is pure bookkeeping: it never sleeps or touches the network.
//! [`crate::client::Client`] drives it and owns the timer.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::error::GatewayError;
use crate::events::EventBus;

/// Backoff and retry limits. Immutable per client instance.
///
/// The n-th consecutive failure waits
/// `min(max_delay, base_delay * multiplier^(n - 1))` before the next attempt.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before giving up. Default: 10.
    pub max_attempts: u32,
    /// Delay after the first failure. Default: 1 s.
    #[serde(rename = "base_delay_ms", with = "crate::config::millis")]
    pub base_delay: Duration,
    /// Ceiling on any single delay. Default: 30 s.
    #[serde(rename = "max_delay_ms", with = "crate::config::millis")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays. Default: 2.0.
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Returns the wait that follows the `failures`-th consecutive failure.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use rtgate::reconnect::ReconnectPolicy;
    ///
    /// let policy = ReconnectPolicy {
    ///     max_attempts: 10,
    ///     base_delay: Duration::from_secs(1),
    ///     max_delay: Duration::from_secs(30),
    ///     multiplier: 2.0,
    /// };
    /// let delays: Vec<u64> = (1..=6).map(|n| policy.delay_for(n).as_secs()).collect();
    /// assert_eq!(delays, vec![1, 2, 4, 8, 16, 30]);
    /// ```
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "reconnect.multiplier",
                reason: "must be a finite number >= 1.0",
            });
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::Invalid {
                field: "reconnect.base_delay_ms",
                reason: "must not exceed max_delay_ms",
            });
        }
        Ok(())
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: attempts exceeded the policy maximum. Requires
    /// [`ReconnectController::reset`].
    Exhausted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Exhausted => "exhausted",
        })
    }
}

/// Emitted on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectEvent {
    /// Consecutive failed attempts so far.
    pub attempt: u32,
    /// State after the transition.
    pub state: ConnectionState,
    /// Backoff before the next attempt, set when entering `Disconnected`
    /// after a failure.
    pub retry_in: Option<Duration>,
}

/// What the driver should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    After(Duration),
    Exhausted,
}

/// Tracks attempts and state for one client.
#[derive(Debug)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    next_delay: Option<Duration>,
    events: EventBus<ReconnectEvent>,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy, events: EventBus<ReconnectEvent>) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            next_delay: None,
            events,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Backoff scheduled by the most recent failure, if any.
    pub fn next_delay(&self) -> Option<Duration> {
        self.next_delay
    }

    /// `Disconnected -> Connecting`, or `-> Exhausted` once the attempt budget
    /// is spent.
    ///
    /// Returns `Ok(false)` without transitioning when an attempt is already in
    /// progress or the client is connected.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ReconnectExhausted`] when the controller is (or
    /// becomes) exhausted.
    pub fn begin_attempt(&mut self) -> Result<bool, GatewayError> {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Exhausted => {
                return Err(GatewayError::ReconnectExhausted {
                    attempts: self.attempts,
                });
            }
            state => {
                debug!(%state, "attempt already active, ignoring");
                return Ok(false);
            }
        }

        if self.attempts >= self.policy.max_attempts {
            self.exhaust();
            return Err(GatewayError::ReconnectExhausted {
                attempts: self.attempts,
            });
        }

        self.next_delay = None;
        self.transition(ConnectionState::Connecting);
        Ok(true)
    }

    /// `Connecting -> Connected`; resets the attempt count.
    pub fn on_connected(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            warn!(state = %self.state, "connect success outside of an attempt, ignoring");
            return false;
        }
        self.attempts = 0;
        self.next_delay = None;
        self.transition(ConnectionState::Connected);
        true
    }

    /// `Connecting -> Disconnected` after a failed attempt.
    ///
    /// Returns the backoff to wait, or [`Retry::Exhausted`] when this failure
    /// spent the last allowed attempt. In that case the controller moves on to
    /// `Exhausted` immediately and no further attempt is scheduled.
    pub fn on_failure(&mut self) -> Option<Retry> {
        if self.state != ConnectionState::Connecting {
            warn!(state = %self.state, "connect failure outside of an attempt, ignoring");
            return None;
        }

        self.attempts += 1;
        if self.attempts >= self.policy.max_attempts {
            self.next_delay = None;
            self.transition(ConnectionState::Disconnected);
            self.exhaust();
            return Some(Retry::Exhausted);
        }

        let delay = self.policy.delay_for(self.attempts);
        self.next_delay = Some(delay);
        self.transition(ConnectionState::Disconnected);
        Some(Retry::After(delay))
    }

    /// `Connecting -> Disconnected` without counting a failure, for attempts
    /// abandoned on shutdown.
    pub fn cancel_attempt(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.next_delay = None;
        self.transition(ConnectionState::Disconnected);
        true
    }

    /// `Connected -> Disconnected` on transport error or remote close.
    pub fn on_disconnected(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        self.transition(ConnectionState::Disconnected);
        true
    }

    /// `Exhausted -> Disconnected` with a fresh attempt budget.
    pub fn reset(&mut self) -> bool {
        if self.state != ConnectionState::Exhausted {
            return false;
        }
        self.attempts = 0;
        self.next_delay = None;
        self.transition(ConnectionState::Disconnected);
        true
    }

    fn exhaust(&mut self) {
        self.next_delay = None;
        warn!(attempts = self.attempts, "reconnection attempts exhausted");
        self.transition(ConnectionState::Exhausted);
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = std::mem::replace(&mut self.state, to);
        info!(%from, %to, attempt = self.attempts, "connection state changed");
        self.events.emit(ReconnectEvent {
            attempt: self.attempts,
            state: to,
            retry_in: self.next_delay,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    fn controller(max_attempts: u32) -> (ReconnectController, broadcast::Receiver<ReconnectEvent>) {
        let bus = EventBus::new(64);
        let rx = bus.subscribe();
        (ReconnectController::new(policy(max_attempts), bus), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<ReconnectEvent>) -> Vec<ReconnectEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn backoff_sequence_hits_ceiling() {
        let (mut ctl, _rx) = controller(10);
        let mut delays = Vec::new();
        for _ in 0..6 {
            ctl.begin_attempt().unwrap();
            match ctl.on_failure() {
                Some(Retry::After(delay)) => delays.push(delay.as_secs()),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30]);
        assert_eq!(ctl.attempts(), 6);
        assert_eq!(ctl.next_delay(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn fractional_multiplier() {
        let policy = ReconnectPolicy {
            multiplier: 1.5,
            ..policy(10)
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2250));
        assert_eq!(policy.delay_for(1_000), Duration::from_secs(30));
    }

    #[test]
    fn exhausted_after_max_consecutive_failures() {
        let (mut ctl, mut rx) = controller(3);
        for _ in 0..2 {
            assert!(ctl.begin_attempt().unwrap());
            assert!(matches!(ctl.on_failure(), Some(Retry::After(_))));
        }
        assert!(ctl.begin_attempt().unwrap());
        assert_eq!(ctl.on_failure(), Some(Retry::Exhausted));
        assert_eq!(ctl.state(), ConnectionState::Exhausted);

        assert!(matches!(
            ctl.begin_attempt(),
            Err(GatewayError::ReconnectExhausted { attempts: 3 })
        ));
        assert_eq!(ctl.state(), ConnectionState::Exhausted);

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.state, ConnectionState::Exhausted);
        assert_eq!(last.attempt, 3);
    }

    #[test]
    fn zero_budget_exhausts_immediately() {
        let (mut ctl, _rx) = controller(0);
        assert!(ctl.begin_attempt().is_err());
        assert_eq!(ctl.state(), ConnectionState::Exhausted);
    }

    #[test]
    fn success_resets_attempts() {
        let (mut ctl, _rx) = controller(5);
        ctl.begin_attempt().unwrap();
        ctl.on_failure();
        ctl.begin_attempt().unwrap();
        ctl.on_failure();
        assert_eq!(ctl.attempts(), 2);

        ctl.begin_attempt().unwrap();
        assert!(ctl.on_connected());
        assert_eq!(ctl.attempts(), 0);
        assert_eq!(ctl.state(), ConnectionState::Connected);

        assert!(ctl.on_disconnected());
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
        assert!(ctl.begin_attempt().unwrap());
    }

    #[test]
    fn every_transition_is_announced() {
        let (mut ctl, mut rx) = controller(5);
        ctl.begin_attempt().unwrap();
        ctl.on_failure();
        ctl.begin_attempt().unwrap();
        ctl.on_connected();
        ctl.on_disconnected();

        let events = drain(&mut rx);
        let states: Vec<_> = events.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
        assert_eq!(events[1].attempt, 1);
        assert_eq!(events[1].retry_in, Some(Duration::from_secs(1)));
        assert_eq!(events[4].retry_in, None);
    }

    #[test]
    fn invalid_transitions_are_ignored() {
        let (mut ctl, mut rx) = controller(5);
        assert!(!ctl.on_connected());
        assert_eq!(ctl.on_failure(), None);
        assert!(!ctl.on_disconnected());
        assert!(!ctl.reset());

        ctl.begin_attempt().unwrap();
        assert!(!ctl.begin_attempt().unwrap());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn cancelled_attempt_is_not_a_failure() {
        let (mut ctl, _rx) = controller(2);
        ctl.begin_attempt().unwrap();
        assert!(ctl.cancel_attempt());
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
        assert_eq!(ctl.attempts(), 0);
        assert!(!ctl.cancel_attempt());
    }

    #[test]
    fn reset_leaves_exhausted() {
        let (mut ctl, _rx) = controller(1);
        ctl.begin_attempt().unwrap();
        assert_eq!(ctl.on_failure(), Some(Retry::Exhausted));
        assert!(ctl.reset());
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
        assert_eq!(ctl.attempts(), 0);
        assert!(ctl.begin_attempt().unwrap());
    }

    #[test]
    fn policy_validation() {
        assert!(policy(3).validate().is_ok());
        let shrinking = ReconnectPolicy {
            multiplier: 0.5,
            ..policy(3)
        };
        assert!(shrinking.validate().is_err());
        let inverted = ReconnectPolicy {
            base_delay: Duration::from_secs(60),
            ..policy(3)
        };
        assert!(inverted.validate().is_err());
    }
}
