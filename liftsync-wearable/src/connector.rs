// Wearable connector
//
// Host-to-wearable traffic handling (session context, plans, auth) and the
// retrying outbox for wearable-to-host commands. Sensor chunks never go
// through the outbox: their loss is tolerated, command loss is not.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use liftsync_utils::message::DeviceMessage;
use liftsync_utils::model::WorkoutPlan;
use liftsync_utils::transport::{DeviceLink, TransportError};

use crate::capture::CaptureTarget;

/// Last authentication signal received from the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub authenticated: bool,
    pub user_id: Option<String>,
}

/// Routes inbound host messages into watchable wearable state.
pub struct WearableConnector;

/// Live state owned by a running connector task.
pub struct ConnectorHandle {
    /// Session/set the capture pipeline should tag samples with.
    pub target: watch::Receiver<CaptureTarget>,
    /// Authentication signal; capture must not start while unauthenticated.
    pub auth: watch::Receiver<AuthState>,
    /// Session ids whose end the host announced.
    pub session_end: mpsc::Receiver<Uuid>,
    plans: Arc<Mutex<Vec<WorkoutPlan>>>,
    task: JoinHandle<()>,
}

impl ConnectorHandle {
    pub async fn plans(&self) -> Vec<WorkoutPlan> {
        self.plans.lock().await.clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl WearableConnector {
    pub fn spawn(mut inbox: mpsc::Receiver<DeviceMessage>) -> ConnectorHandle {
        let (target_tx, target_rx) = watch::channel(CaptureTarget::none());
        let (auth_tx, auth_rx) = watch::channel(AuthState::default());
        let (end_tx, end_rx) = mpsc::channel(8);
        let plans = Arc::new(Mutex::new(Vec::new()));
        let plans_task = plans.clone();

        let task = tokio::spawn(async move {
            let mut authenticated = false;
            while let Some(message) = inbox.recv().await {
                match message {
                    DeviceMessage::SessionContext {
                        session_id, set_id, ..
                    } => {
                        // Capture never arms without an authenticated user;
                        // a context straggling in after logout is dropped.
                        if !authenticated {
                            warn!("session context while unauthenticated, dropped");
                            continue;
                        }
                        match Uuid::parse_str(&session_id) {
                            Ok(session) => {
                                let set = set_id.as_deref().and_then(|s| Uuid::parse_str(s).ok());
                                target_tx.send_replace(CaptureTarget {
                                    session_id: Some(session),
                                    set_id: set,
                                });
                            }
                            Err(_) => warn!("session context with bad id: {}", session_id),
                        }
                    }
                    DeviceMessage::SessionEnd { session_id, .. } => {
                        target_tx.send_replace(CaptureTarget::none());
                        match Uuid::parse_str(&session_id) {
                            Ok(session) => {
                                let _ = end_tx.send(session).await;
                            }
                            Err(_) => warn!("session end with bad id: {}", session_id),
                        }
                    }
                    DeviceMessage::WorkoutPlans { plans } => {
                        info!("received {} workout plans", plans.len());
                        *plans_task.lock().await = plans;
                    }
                    DeviceMessage::AuthStatus {
                        authenticated: is_authed,
                        user_id,
                    } => {
                        authenticated = is_authed;
                        if !authenticated {
                            // Logout clears all local session state
                            target_tx.send_replace(CaptureTarget::none());
                        }
                        auth_tx.send_replace(AuthState {
                            authenticated,
                            user_id,
                        });
                    }
                    DeviceMessage::Unknown => {
                        debug!("ignoring unknown message type");
                    }
                    other => {
                        debug!("ignoring host-bound message on wearable: {:?}", other);
                    }
                }
            }
            debug!("wearable connector inbox closed");
        });

        ConnectorHandle {
            target: target_rx,
            auth: auth_rx,
            session_end: end_rx,
            plans,
            task,
        }
    }
}

/// Configuration for command retry behavior
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Delivery attempts per command before giving up.
    pub max_retries: u32,

    /// First retry delay; doubles per attempt.
    pub base_backoff: Duration,

    /// Ceiling on the per-attempt delay.
    pub max_backoff: Duration,

    /// Commands queued before `send` reports backpressure.
    pub queue_capacity: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            queue_capacity: 32,
        }
    }
}

/// A command the outbox gave up on after exhausting retries.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub message: DeviceMessage,
    pub attempts: u32,
    pub last_error: TransportError,
}

struct PendingCommand {
    message: DeviceMessage,
    attempts: u32,
}

/// Reliable-ish egress for commands: failed sends are kept and retried
/// with exponential backoff, and a reachability-restored signal flushes
/// the queue immediately. After the retry ceiling a command is surfaced
/// as a [`DeliveryFailure`] instead of silently vanishing.
pub struct CommandOutbox {
    tx: mpsc::Sender<DeviceMessage>,
    task: JoinHandle<()>,
}

impl CommandOutbox {
    pub fn spawn(
        link: Arc<dyn DeviceLink>,
        config: OutboxConfig,
    ) -> (Self, mpsc::Receiver<DeliveryFailure>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (failure_tx, failure_rx) = mpsc::channel(16);
        let task = tokio::spawn(run_outbox(link, config, rx, failure_tx));
        (Self { tx, task }, failure_rx)
    }

    /// Queue a command for delivery. Fails only when the queue itself is
    /// full or the outbox task is gone.
    pub fn send(&self, message: DeviceMessage) -> Result<(), TransportError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Disconnected),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn run_outbox(
    link: Arc<dyn DeviceLink>,
    config: OutboxConfig,
    mut rx: mpsc::Receiver<DeviceMessage>,
    failure_tx: mpsc::Sender<DeliveryFailure>,
) {
    let mut pending: VecDeque<PendingCommand> = VecDeque::new();
    let mut reach_rx = link.reachability();
    let mut next_retry: Option<Instant> = None;

    loop {
        let retry_at = next_retry.unwrap_or_else(|| Instant::now() + Duration::from_secs(3_600));

        select! {
            command = rx.recv() => {
                match command {
                    Some(message) => {
                        pending.push_back(PendingCommand { message, attempts: 0 });
                        next_retry = flush(link.as_ref(), &config, &mut pending, &failure_tx).await;
                    }
                    None => {
                        // Caller gone; one last best-effort pass
                        flush(link.as_ref(), &config, &mut pending, &failure_tx).await;
                        break;
                    }
                }
            }

            result = reach_rx.changed() => {
                if result.is_ok() && *reach_rx.borrow() && !pending.is_empty() {
                    debug!("peer reachable again, flushing {} pending commands", pending.len());
                    next_retry = flush(link.as_ref(), &config, &mut pending, &failure_tx).await;
                }
            }

            _ = sleep_until(retry_at), if next_retry.is_some() => {
                next_retry = flush(link.as_ref(), &config, &mut pending, &failure_tx).await;
            }
        }
    }
}

/// Send queued commands in order. Returns the instant of the next retry if
/// a command failed but still has attempts left.
async fn flush(
    link: &dyn DeviceLink,
    config: &OutboxConfig,
    pending: &mut VecDeque<PendingCommand>,
    failure_tx: &mpsc::Sender<DeliveryFailure>,
) -> Option<Instant> {
    while let Some(front) = pending.front_mut() {
        match link.send(front.message.clone()).await {
            Ok(()) => {
                pending.pop_front();
            }
            Err(e) => {
                front.attempts += 1;
                if front.attempts >= config.max_retries {
                    warn!(
                        "command abandoned after {} attempts: {}",
                        front.attempts, e
                    );
                    if let Some(command) = pending.pop_front() {
                        let _ = failure_tx
                            .send(DeliveryFailure {
                                message: command.message,
                                attempts: command.attempts,
                                last_error: e,
                            })
                            .await;
                    }
                    continue;
                }
                return Some(Instant::now() + backoff_delay(config, front.attempts));
            }
        }
    }
    None
}

/// Exponential backoff: base, 2x base, 4x base... capped at `max_backoff`.
fn backoff_delay(config: &OutboxConfig, attempts: u32) -> Duration {
    let factor = 1u32 << attempts.saturating_sub(1).min(16);
    config
        .base_backoff
        .saturating_mul(factor)
        .min(config.max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftsync_utils::transport::link_pair;

    fn context_message(session: Uuid, set: Option<Uuid>) -> DeviceMessage {
        DeviceMessage::SessionContext {
            session_id: session.to_string(),
            exercise_id: None,
            set_id: set.map(|s| s.to_string()),
            phase: "execution".to_string(),
            timestamp: 0.0,
        }
    }

    async fn sign_in(tx: &mpsc::Sender<DeviceMessage>) {
        tx.send(DeviceMessage::AuthStatus {
            authenticated: true,
            user_id: Some("user-1".to_string()),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_session_context_updates_capture_target() {
        let (tx, rx) = mpsc::channel(8);
        let mut handle = WearableConnector::spawn(rx);
        let session = Uuid::new_v4();
        let set = Uuid::new_v4();

        sign_in(&tx).await;
        tx.send(context_message(session, Some(set))).await.unwrap();
        handle.target.changed().await.unwrap();

        assert_eq!(*handle.target.borrow(), CaptureTarget::set(session, set));
        handle.abort();
    }

    #[tokio::test]
    async fn test_context_while_unauthenticated_never_arms_capture() {
        let (tx, rx) = mpsc::channel(8);
        let mut handle = WearableConnector::spawn(rx);

        // No auth signal yet; the context must be dropped
        tx.send(context_message(Uuid::new_v4(), Some(Uuid::new_v4())))
            .await
            .unwrap();
        sign_in(&tx).await;
        handle.auth.changed().await.unwrap();

        assert_eq!(*handle.target.borrow(), CaptureTarget::none());

        // Same after an explicit logout
        tx.send(DeviceMessage::AuthStatus {
            authenticated: false,
            user_id: None,
        })
        .await
        .unwrap();
        handle.auth.changed().await.unwrap();

        tx.send(context_message(Uuid::new_v4(), Some(Uuid::new_v4())))
            .await
            .unwrap();
        sign_in(&tx).await;
        handle.auth.changed().await.unwrap();

        assert_eq!(*handle.target.borrow(), CaptureTarget::none());
        handle.abort();
    }

    #[tokio::test]
    async fn test_session_end_clears_target_and_notifies() {
        let (tx, rx) = mpsc::channel(8);
        let mut handle = WearableConnector::spawn(rx);
        let session = Uuid::new_v4();

        sign_in(&tx).await;
        tx.send(context_message(session, Some(Uuid::new_v4())))
            .await
            .unwrap();
        tx.send(DeviceMessage::SessionEnd {
            session_id: session.to_string(),
            timestamp: 1.0,
        })
        .await
        .unwrap();

        assert_eq!(handle.session_end.recv().await, Some(session));
        assert_eq!(*handle.target.borrow(), CaptureTarget::none());
        handle.abort();
    }

    #[tokio::test]
    async fn test_logout_clears_target() {
        let (tx, rx) = mpsc::channel(8);
        let mut handle = WearableConnector::spawn(rx);

        sign_in(&tx).await;
        tx.send(context_message(Uuid::new_v4(), Some(Uuid::new_v4())))
            .await
            .unwrap();
        handle.target.changed().await.unwrap();

        tx.send(DeviceMessage::AuthStatus {
            authenticated: false,
            user_id: None,
        })
        .await
        .unwrap();
        handle.auth.changed().await.unwrap();

        assert!(!handle.auth.borrow().authenticated);
        assert_eq!(*handle.target.borrow(), CaptureTarget::none());
        handle.abort();
    }

    #[tokio::test]
    async fn test_unknown_message_is_ignored() {
        let (tx, rx) = mpsc::channel(8);
        let handle = WearableConnector::spawn(rx);

        tx.send(DeviceMessage::Unknown).await.unwrap();
        tx.send(DeviceMessage::WorkoutPlans { plans: vec![] })
            .await
            .unwrap();

        // Still alive and processing after the unknown message
        while handle.plans().await.is_empty() {
            tokio::task::yield_now().await;
        }
        handle.abort();
    }

    #[tokio::test]
    async fn test_outbox_delivers_when_reachable() {
        let mut pair = link_pair(8);
        let (outbox, _failures) =
            CommandOutbox::spawn(Arc::new(pair.wearable.clone()), OutboxConfig::default());

        outbox
            .send(DeviceMessage::EndWorkout {
                session_id: "s".to_string(),
                timestamp: 0.0,
            })
            .unwrap();

        let received = pair.host_inbox.recv().await.unwrap();
        assert!(matches!(received, DeviceMessage::EndWorkout { .. }));
        outbox.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbox_flushes_on_reachability_restored() {
        let mut pair = link_pair(8);
        pair.control.set_reachable(false);
        let config = OutboxConfig {
            max_retries: 100,
            ..Default::default()
        };
        let (outbox, _failures) = CommandOutbox::spawn(Arc::new(pair.wearable.clone()), config);

        outbox
            .send(DeviceMessage::StartExercise {
                session_id: "s".to_string(),
                template_name: "Squat".to_string(),
                timestamp: 0.0,
            })
            .unwrap();

        pair.control.set_reachable(true);

        let received = pair.host_inbox.recv().await.unwrap();
        assert!(matches!(received, DeviceMessage::StartExercise { .. }));
        outbox.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbox_surfaces_persistent_failure() {
        let pair = link_pair(8);
        pair.control.set_reachable(false);
        let config = OutboxConfig {
            max_retries: 3,
            base_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        let (outbox, mut failures) = CommandOutbox::spawn(Arc::new(pair.wearable.clone()), config);

        outbox
            .send(DeviceMessage::EndSet {
                session_id: "s".to_string(),
                actual_reps: 8,
                rest_secs: 60.0,
                heart_rate_bpm: None,
                calories_kcal: None,
                timestamp: 0.0,
            })
            .unwrap();

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.last_error, TransportError::Unreachable);
        assert!(matches!(failure.message, DeviceMessage::EndSet { .. }));
        outbox.abort();
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = OutboxConfig {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            ..Default::default()
        };

        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(5));
    }
}
