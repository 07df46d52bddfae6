// Device transport contract
//
// Best-effort, bidirectional message delivery between wearable and host.
// There is no persistent queue in the transport itself: a send while the
// peer is unreachable fails at the caller, and the caller decides whether
// the failure matters (commands) or not (sensor chunks). Reachability is a
// watchable boolean so callers can flush cached messages when the peer
// comes back.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::{mpsc, watch};

use crate::message::{DeviceMessage, ParsedMessage};

/// Errors that can occur sending over the device link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer is currently unreachable; the message was not delivered
    Unreachable,
    /// Peer end of the link is gone for good
    Disconnected,
    /// Link buffer is full; the message was not delivered
    QueueFull,
    /// Send did not complete within the configured bound
    Timeout { duration_ms: u64 },
    /// The message did not survive the wire encoding
    Codec(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => write!(f, "peer unreachable"),
            Self::Disconnected => write!(f, "link disconnected"),
            Self::QueueFull => write!(f, "link buffer full"),
            Self::Timeout { duration_ms } => {
                write!(f, "send timed out after {}ms", duration_ms)
            }
            Self::Codec(msg) => write!(f, "message failed wire encoding: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One direction of the device link.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Deliver a message to the peer, best-effort. Never blocks
    /// indefinitely; failures are reported, not retried.
    async fn send(&self, message: DeviceMessage) -> TransportResult<()>;

    /// Snapshot of current peer reachability.
    fn is_reachable(&self) -> bool;

    /// Watch reachability changes (true = reachable).
    fn reachability(&self) -> watch::Receiver<bool>;
}

/// In-process link endpoint backed by a bounded channel. Used by tests and
/// by single-process deployments where both roles run in one binary.
///
/// Every message crosses in its wire form: encoded to a JSON line on send
/// and re-parsed on the way in, exactly as a socket link would put it on
/// the wire.
#[derive(Debug, Clone)]
pub struct InMemoryLink {
    outbound: mpsc::Sender<DeviceMessage>,
    reachable: watch::Receiver<bool>,
}

#[async_trait]
impl DeviceLink for InMemoryLink {
    async fn send(&self, message: DeviceMessage) -> TransportResult<()> {
        if !*self.reachable.borrow() {
            return Err(TransportError::Unreachable);
        }
        let line = message
            .encode_line()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        let message = match DeviceMessage::parse_line(&line) {
            ParsedMessage::Message(message) => message,
            ParsedMessage::ParseError { error, .. } => {
                return Err(TransportError::Codec(error));
            }
        };
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Disconnected),
        }
    }

    fn is_reachable(&self) -> bool {
        *self.reachable.borrow()
    }

    fn reachability(&self) -> watch::Receiver<bool> {
        self.reachable.clone()
    }
}

/// Test/simulation handle flipping reachability for both directions at once.
#[derive(Debug)]
pub struct ReachabilityControl {
    tx: watch::Sender<bool>,
}

impl ReachabilityControl {
    pub fn set_reachable(&self, reachable: bool) {
        // Receivers only exist while links do; a closed channel is fine here
        let _ = self.tx.send(reachable);
    }
}

/// Both endpoints of an in-memory link plus their inboxes.
pub struct LinkPair {
    /// Endpoint held by the wearable; its sends land in `host_inbox`.
    pub wearable: InMemoryLink,
    /// Endpoint held by the host; its sends land in `wearable_inbox`.
    pub host: InMemoryLink,
    pub wearable_inbox: mpsc::Receiver<DeviceMessage>,
    pub host_inbox: mpsc::Receiver<DeviceMessage>,
    pub control: ReachabilityControl,
}

/// Build a connected link pair with the given per-direction buffer size.
pub fn link_pair(capacity: usize) -> LinkPair {
    let (reach_tx, reach_rx) = watch::channel(true);
    let (to_host_tx, to_host_rx) = mpsc::channel(capacity);
    let (to_wearable_tx, to_wearable_rx) = mpsc::channel(capacity);

    LinkPair {
        wearable: InMemoryLink {
            outbound: to_host_tx,
            reachable: reach_rx.clone(),
        },
        host: InMemoryLink {
            outbound: to_wearable_tx,
            reachable: reach_rx,
        },
        wearable_inbox: to_wearable_rx,
        host_inbox: to_host_rx,
        control: ReachabilityControl { tx: reach_tx },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_peer_inbox() {
        let mut pair = link_pair(8);

        pair.wearable
            .send(DeviceMessage::EndWorkout {
                session_id: "s-1".to_string(),
                timestamp: 0.0,
            })
            .await
            .unwrap();

        let received = pair.host_inbox.recv().await.unwrap();
        assert!(matches!(received, DeviceMessage::EndWorkout { .. }));
    }

    #[tokio::test]
    async fn test_messages_cross_in_wire_form() {
        let mut pair = link_pair(8);

        pair.host
            .send(DeviceMessage::SessionContext {
                session_id: "s-1".to_string(),
                exercise_id: Some("e-1".to_string()),
                set_id: None,
                phase: "rest".to_string(),
                timestamp: 12.5,
            })
            .await
            .unwrap();

        match pair.wearable_inbox.recv().await.unwrap() {
            DeviceMessage::SessionContext {
                session_id,
                exercise_id,
                set_id,
                phase,
                timestamp,
            } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(exercise_id.as_deref(), Some("e-1"));
                assert!(set_id.is_none());
                assert_eq!(phase, "rest");
                assert_eq!(timestamp, 12.5);
            }
            other => panic!("expected context, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_send() {
        let pair = link_pair(8);
        pair.control.set_reachable(false);

        let result = pair
            .wearable
            .send(DeviceMessage::SensorData { chunks: vec![] })
            .await;

        assert_eq!(result, Err(TransportError::Unreachable));
        assert!(!pair.wearable.is_reachable());
    }

    #[tokio::test]
    async fn test_full_buffer_fails_send() {
        let pair = link_pair(1);

        pair.host
            .send(DeviceMessage::AuthStatus {
                authenticated: true,
                user_id: Some("u".to_string()),
            })
            .await
            .unwrap();

        let result = pair
            .host
            .send(DeviceMessage::AuthStatus {
                authenticated: false,
                user_id: None,
            })
            .await;

        assert_eq!(result, Err(TransportError::QueueFull));
    }

    #[tokio::test]
    async fn test_reachability_watch_observes_changes() {
        let pair = link_pair(1);
        let mut watcher = pair.host.reachability();

        pair.control.set_reachable(false);
        watcher.changed().await.unwrap();
        assert!(!*watcher.borrow());

        pair.control.set_reachable(true);
        watcher.changed().await.unwrap();
        assert!(*watcher.borrow());
    }
}
