//! Error types shared by every harness component.
//!
//! Failures fall into four kinds (see [`FailureKind`]). Timeouts, protocol
//! violations and usage errors are the ones scenarios assert on; transport
//! failures cover everything the network or the launcher can do to us.

use std::net::SocketAddr;
use std::time::Duration;

/// Result alias used throughout the harness.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Coarse classification of a [`HarnessError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A bounded wait expired.
    Timeout,
    /// Bytes on an HTTP connection failed strict parsing.
    ProtocolViolation,
    /// An operation was invoked on an object in an invalid state.
    Usage,
    /// Connect, socket or launcher failure.
    Transport,
}

/// Error types for the harness.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("no connection accepted on {addr} within {timeout:?}")]
    AcceptTimeout { addr: SocketAddr, timeout: Duration },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("usage error: {0}")]
    Usage(String),
    #[error("failed to connect to {addr} after {attempts} attempts: {reason}")]
    ConnectFailed {
        addr: SocketAddr,
        attempts: u32,
        reason: String,
    },
    #[error("connection closed after {received} of {expected} expected bytes")]
    ConnectionClosedEarly { expected: usize, received: usize },
    #[error("peer disconnected before the request was complete")]
    IncompleteRequest,
    #[error("{0}: peer disconnected")]
    Disconnected(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("launcher error: {0}")]
    Launch(String),
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Shorthand for building a [`HarnessError::Usage`].
    pub fn usage(message: impl Into<String>) -> Self {
        HarnessError::Usage(message.into())
    }

    /// Shorthand for building a [`HarnessError::Timeout`].
    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        HarnessError::Timeout {
            what: what.into(),
            timeout,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            HarnessError::Timeout { .. } | HarnessError::AcceptTimeout { .. } => {
                FailureKind::Timeout
            }
            HarnessError::ProtocolViolation(_) => FailureKind::ProtocolViolation,
            HarnessError::Http(e) if e.is_parse() => FailureKind::ProtocolViolation,
            HarnessError::Usage(_) | HarnessError::Config(_) => FailureKind::Usage,
            HarnessError::ConnectFailed { .. }
            | HarnessError::ConnectionClosedEarly { .. }
            | HarnessError::IncompleteRequest
            | HarnessError::Disconnected(_)
            | HarnessError::Launch(_)
            | HarnessError::Http(_)
            | HarnessError::Io(_) => FailureKind::Transport,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == FailureKind::Timeout
    }
}
