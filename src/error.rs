//! Error types for the command router, the socket capability and the
//! connection driver.
//!
//! [`ConnectionError`] is the error a connection run ends with. Each variant
//! maps to a WebSocket close code so the transport adapter can tell the peer
//! why the connection is being torn down.

/// Close code for a normal shutdown initiated by an endpoint going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code for a peer that violated the command protocol.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close code for an unexpected server-side failure.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Failure reported by the underlying transport on send or ping.
///
/// Returned unchanged to the caller and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    /// The connection (or its writer task) is gone.
    #[error("socket is closed")]
    Closed,

    /// The outbound buffer is full; the frame was not queued.
    #[error("outbound buffer is full")]
    BufferFull,

    /// The transport failed while writing or reading a frame.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A text frame that is not a command envelope.
///
/// Non-fatal by default: the router drops the frame without invoking a
/// handler.
#[derive(Debug, thiserror::Error)]
pub enum MalformedFrame {
    /// The payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The `command` field is missing, empty, or not a string.
    #[error("missing `command` field")]
    MissingCommand,

    /// The `data` field is missing or `null`.
    #[error("missing `data` field")]
    MissingData,
}

/// Errors surfaced by [`crate::ws::router::CommandRouter::dispatch`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A well-formed envelope named a command with no registered handler.
    #[error("the handler for command `{0}` was not registered")]
    UnregisteredCommand(String),

    /// A malformed frame under [`crate::ws::router::MalformedFramePolicy::Reject`].
    #[error("malformed command frame: {0}")]
    Malformed(#[from] MalformedFrame),

    /// The registered handler returned an error.
    #[error("handler for command `{command}` failed: {source}")]
    Handler {
        /// Command whose handler failed.
        command: String,
        /// The error the handler returned, untouched.
        #[source]
        source: anyhow::Error,
    },
}

/// Errors from the outbound JSON helpers.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The value could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The transport rejected the frame.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Fatal error that ends a [`crate::ws::connection::Connection`] run.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Inbound dispatch failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The transport failed during a heartbeat ping.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

impl ConnectionError {
    /// Returns the WebSocket close code for this error.
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::Dispatch(DispatchError::UnregisteredCommand(_) | DispatchError::Malformed(_)) => {
                CLOSE_POLICY_VIOLATION
            }
            Self::Dispatch(DispatchError::Handler { .. }) | Self::Socket(_) => {
                CLOSE_INTERNAL_ERROR
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_command_is_policy_violation() {
        let err = ConnectionError::from(DispatchError::UnregisteredCommand("x".to_string()));
        assert_eq!(err.close_code(), CLOSE_POLICY_VIOLATION);
        assert_eq!(
            err.to_string(),
            "the handler for command `x` was not registered"
        );
    }

    #[test]
    fn malformed_frame_is_policy_violation() {
        let err = ConnectionError::from(DispatchError::from(MalformedFrame::MissingData));
        assert_eq!(err.close_code(), CLOSE_POLICY_VIOLATION);
    }

    #[test]
    fn handler_failure_is_internal_error() {
        let err = ConnectionError::from(DispatchError::Handler {
            command: "echo".to_string(),
            source: anyhow::anyhow!("boom"),
        });
        assert_eq!(err.close_code(), CLOSE_INTERNAL_ERROR);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn handler_source_is_preserved() {
        let err = DispatchError::Handler {
            command: "echo".to_string(),
            source: anyhow::anyhow!("boom"),
        };
        let Some(source) = std::error::Error::source(&err) else {
            panic!("expected a source error");
        };
        assert_eq!(source.to_string(), "boom");
    }

    #[test]
    fn socket_error_is_internal_error() {
        let err = ConnectionError::from(SocketError::Closed);
        assert_eq!(err.close_code(), CLOSE_INTERNAL_ERROR);
        assert_eq!(err.to_string(), "socket is closed");
    }
}
