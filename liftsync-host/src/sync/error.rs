// Sync engine errors
//
// Everything here is transient from the caller's perspective: the engine
// retries with backoff and only after the ceiling surfaces a persistent
// failure through the notice channel.

use std::fmt;

/// Errors that can occur talking to the remote store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The remote store could not be reached or rejected the request
    RemoteUnavailable(String),
    /// The operation exceeded its configured bound
    Timeout { duration_ms: u64 },
    /// The entity could not be serialized or the remote copy deserialized
    Serialization(String),
    /// All retry attempts were consumed without a confirmed ack
    RetriesExhausted { attempts: u32 },
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteUnavailable(msg) => write!(f, "remote store unavailable: {}", msg),
            Self::Timeout { duration_ms } => {
                write!(f, "remote operation timed out after {}ms", duration_ms)
            }
            Self::Serialization(msg) => write!(f, "sync serialization error: {}", msg),
            Self::RetriesExhausted { attempts } => {
                write!(f, "sync gave up after {} attempts", attempts)
            }
        }
    }
}

impl std::error::Error for SyncError {}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
