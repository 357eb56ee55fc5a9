//! Sync error types.

use thiserror::Error;

use crate::store::StorageError;

/// Failure reported by a [`Transport`](crate::connection::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced by the sync client.
///
/// Apart from input validation these are never returned from the public
/// API; they are delivered to `on_error` listeners where they occur.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The channel could not be opened or closed unexpectedly.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Reading or writing persisted state failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// A received or submitted event failed shape validation.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Reconnect attempts were exhausted.
    #[error("Gave up reconnecting after {attempts} attempt(s)")]
    MaxRetriesExceeded { attempts: u32 },

    /// The channel is not open.
    #[error("Not connected")]
    NotConnected,

    /// The async driver owning the client has exited.
    #[error("Sync driver has stopped")]
    Stopped,
}

impl SyncError {
    /// Short category name used in logs and CLI output.
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::Transport(_) => "transport",
            SyncError::Persistence(_) => "persistence",
            SyncError::MalformedEvent(_) => "malformed-event",
            SyncError::MaxRetriesExceeded { .. } => "max-retries-exceeded",
            SyncError::NotConnected => "not-connected",
            SyncError::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SyncError::MaxRetriesExceeded { attempts: 10 };
        assert_eq!(err.to_string(), "Gave up reconnecting after 10 attempt(s)");
        assert_eq!(err.category(), "max-retries-exceeded");

        let err: SyncError = TransportError::new("connection refused").into();
        assert_eq!(err.to_string(), "Transport error: connection refused");
    }
}
