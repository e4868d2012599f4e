//! Crate-wide error taxonomy.

use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::FrameError;
use crate::message::MessageError;
use crate::registry::ConnectionId;
use crate::transport::TransportError;

/// Errors surfaced by gateway and client operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The target connection is not registered. Caller error.
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A liveness probe went unanswered.
    #[error("connection {0} did not answer its liveness probe")]
    ProbeTimeout(ConnectionId),

    /// The client gave up reconnecting. Terminal until reset.
    #[error("reconnection abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    /// Returns `true` for failures that should tear the connection down
    /// (transport errors and probe timeouts are treated the same way).
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ProbeTimeout(_) | Self::Frame(_))
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_timeout_is_fatal_like_transport() {
        assert!(GatewayError::ProbeTimeout(ConnectionId::from(3)).is_connection_fatal());
        assert!(GatewayError::Transport(TransportError::Closed).is_connection_fatal());
        assert!(!GatewayError::ConnectionNotFound(ConnectionId::from(3)).is_connection_fatal());
    }

    #[test]
    fn messages_name_the_connection() {
        let err = GatewayError::ConnectionNotFound(ConnectionId::from(42));
        assert_eq!(err.to_string(), "connection #42 not found");
        let err = GatewayError::ReconnectExhausted { attempts: 5 };
        assert_eq!(err.to_string(), "reconnection abandoned after 5 attempts");
    }
}
