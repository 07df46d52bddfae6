// Cloud sync engine
//
// Reconciles local syncable entities against the remote document store
// without ever blocking a user-facing operation. Every remote call is
// bounded by a timeout and retried with exponential backoff; after the
// retry ceiling the failure is published as a notice instead of being
// dropped. The dirty flag is cleared only on a confirmed remote ack.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use uuid::Uuid;

use liftsync_utils::entity::Syncable;

use super::error::{SyncError, SyncResult};
use super::remote::RemoteStore;

/// How to reconcile one entity against the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Push the local copy regardless of the dirty flag.
    Upload,
    /// Replace the local copy with the remote one, if it exists.
    Download,
    /// Tombstone the remote document by identifier.
    Delete,
    /// Upload if dirty, otherwise refresh from remote.
    FullSync,
    /// Upload if dirty, otherwise do nothing.
    Auto,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
            Self::Delete => write!(f, "delete"),
            Self::FullSync => write!(f, "full_sync"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Configuration for sync behavior
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Attempts per operation before surfacing a persistent failure.
    pub max_retries: u32,

    /// First retry delay; doubles per attempt.
    pub base_backoff: Duration,

    /// Ceiling on the per-attempt delay.
    pub max_backoff: Duration,

    /// Bound on each individual remote call.
    pub op_timeout: Duration,

    /// Period of the scheduler's reconciliation timer.
    pub sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            op_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(60),
        }
    }
}

/// How one sync operation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Uploaded { at: DateTime<Utc> },
    Downloaded { at: DateTime<Utc> },
    Deleted { at: DateTime<Utc> },
    /// Nothing to do: clean under `auto`, or no remote copy to download.
    Skipped,
}

/// Out-of-band sync events for the collaborator layer.
#[derive(Debug, Clone)]
pub enum SyncNotice {
    Completed {
        collection: String,
        key: Uuid,
        outcome: SyncOutcome,
    },
    /// The retry ceiling was hit; the entity stays dirty and needs
    /// operator attention or a later full reconciliation.
    PersistentFailure {
        collection: String,
        key: Uuid,
        attempts: u32,
        error: SyncError,
    },
}

/// Per-entity result from a batch pass.
#[derive(Debug)]
pub struct SyncReport {
    pub collection: &'static str,
    pub key: Uuid,
    pub result: SyncResult<SyncOutcome>,
}

/// An upload snapshotted from its owner, shippable without holding the
/// owner's lock.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub collection: &'static str,
    pub key: Uuid,
    pub body: Value,
    /// Dirty generation of the entity at snapshot time; the ack is only
    /// allowed to clear the flag while this is still current.
    pub generation: u64,
}

/// Source of pending uploads for background reconciliation passes. The
/// implementor owns the live entities; the engine only sees snapshots and
/// reports confirmed acks back through [`SyncRoster::confirm`].
#[async_trait]
pub trait SyncRoster: Send + Sync {
    async fn pending_uploads(&self) -> Vec<SyncJob>;

    /// Record a confirmed remote write for the snapshot taken at
    /// `generation`. An entity mutated since that snapshot must stay
    /// dirty so the next pass re-uploads it.
    async fn confirm(&self, collection: &str, key: Uuid, at: DateTime<Utc>, generation: u64);
}

/// Counters from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncPassSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    notice_tx: mpsc::Sender<SyncNotice>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> (Self, mpsc::Receiver<SyncNotice>) {
        let (notice_tx, notice_rx) = mpsc::channel(64);
        (
            Self {
                remote,
                config,
                notice_tx,
            },
            notice_rx,
        )
    }

    /// Reconcile with the `Auto` strategy: upload if dirty, else nothing.
    pub async fn execute<E>(&self, entity: &mut E) -> SyncResult<SyncOutcome>
    where
        E: Syncable + Serialize + DeserializeOwned + Send,
    {
        self.execute_with(entity, SyncStrategy::Auto).await
    }

    /// Reconcile one entity with an explicit strategy.
    ///
    /// Safe to invoke concurrently for the same entity: uploads are keyed
    /// merge-on-write puts, so a duplicate attempt converges on the same
    /// remote state.
    pub async fn execute_with<E>(
        &self,
        entity: &mut E,
        strategy: SyncStrategy,
    ) -> SyncResult<SyncOutcome>
    where
        E: Syncable + Serialize + DeserializeOwned + Send,
    {
        match strategy {
            SyncStrategy::Auto => {
                if !entity.needs_sync() {
                    return Ok(SyncOutcome::Skipped);
                }
                self.upload_entity(entity).await
            }
            SyncStrategy::Upload => self.upload_entity(entity).await,
            SyncStrategy::Download => self.download_entity(entity).await,
            SyncStrategy::Delete => {
                self.schedule_delete(entity.collection(), entity.entity_id())
                    .await
            }
            SyncStrategy::FullSync => {
                if entity.needs_sync() {
                    self.upload_entity(entity).await
                } else {
                    self.download_entity(entity).await
                }
            }
        }
    }

    /// Reconcile each entity independently with `Auto`. One failure never
    /// aborts the rest of the batch.
    pub async fn execute_batch<E>(&self, entities: &mut [E]) -> Vec<SyncReport>
    where
        E: Syncable + Serialize + DeserializeOwned + Send,
    {
        let mut reports = Vec::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            let collection = entity.collection();
            let key = entity.entity_id();
            reports.push(SyncReport {
                collection,
                key,
                result: self.execute(entity).await,
            });
        }
        reports
    }

    /// Tombstone a remote document without needing the live entity.
    pub async fn schedule_delete(
        &self,
        collection: &'static str,
        key: Uuid,
    ) -> SyncResult<SyncOutcome> {
        let remote = self.remote.clone();
        let ack = self
            .retry(collection, key, || {
                let remote = remote.clone();
                async move { remote.delete(collection, key).await }
            })
            .await?;
        let outcome = SyncOutcome::Deleted {
            at: ack.server_updated_at,
        };
        self.notify_completed(collection, key, outcome);
        Ok(outcome)
    }

    /// One full reconciliation pass over everything the roster reports
    /// dirty. Confirmed acks flow back to the roster, which clears the
    /// flags on the live entities.
    pub async fn sync_all_pending(&self, roster: &dyn SyncRoster) -> SyncPassSummary {
        let jobs = roster.pending_uploads().await;
        let mut summary = SyncPassSummary::default();
        for job in jobs {
            summary.attempted += 1;
            let remote = self.remote.clone();
            let collection = job.collection;
            let key = job.key;
            let generation = job.generation;
            let body = job.body;
            let result = self
                .retry(collection, key, || {
                    let remote = remote.clone();
                    let body = body.clone();
                    async move { remote.upload(collection, key, body).await }
                })
                .await;
            match result {
                Ok(ack) => {
                    roster
                        .confirm(collection, key, ack.server_updated_at, generation)
                        .await;
                    summary.succeeded += 1;
                }
                Err(e) => {
                    warn!("pending upload {}/{} not confirmed: {}", collection, key, e);
                    summary.failed += 1;
                }
            }
        }
        if summary.attempted > 0 {
            info!(
                "sync pass: {}/{} uploads confirmed",
                summary.succeeded, summary.attempted
            );
        }
        summary
    }

    /// Run the background scheduler: reconciliation passes on dirty
    /// nudges, on reachability restoration, and on a periodic timer.
    pub fn spawn_scheduler(
        self: &Arc<Self>,
        roster: Arc<dyn SyncRoster>,
        reachability: watch::Receiver<bool>,
    ) -> SchedulerHandle {
        let (dirty_tx, dirty_rx) = mpsc::channel(16);
        let task = tokio::spawn(run_scheduler(self.clone(), roster, reachability, dirty_rx));
        SchedulerHandle { dirty_tx, task }
    }

    async fn upload_entity<E>(&self, entity: &mut E) -> SyncResult<SyncOutcome>
    where
        E: Syncable + Serialize + Send,
    {
        let collection = entity.collection();
        let key = entity.entity_id();
        let body = serde_json::to_value(&*entity)?;
        let remote = self.remote.clone();
        let ack = self
            .retry(collection, key, || {
                let remote = remote.clone();
                let body = body.clone();
                async move { remote.upload(collection, key, body).await }
            })
            .await?;
        entity.mark_synced(ack.server_updated_at);
        let outcome = SyncOutcome::Uploaded {
            at: ack.server_updated_at,
        };
        self.notify_completed(collection, key, outcome);
        Ok(outcome)
    }

    async fn download_entity<E>(&self, entity: &mut E) -> SyncResult<SyncOutcome>
    where
        E: Syncable + DeserializeOwned + Send,
    {
        let collection = entity.collection();
        let key = entity.entity_id();
        let remote = self.remote.clone();
        let copy = self
            .retry(collection, key, || {
                let remote = remote.clone();
                async move { remote.download(collection, key).await }
            })
            .await?;
        match copy {
            None => {
                debug!("no remote copy of {}/{}", collection, key);
                Ok(SyncOutcome::Skipped)
            }
            Some(copy) => {
                *entity = serde_json::from_value(copy.body)?;
                entity.mark_synced(copy.server_updated_at);
                let outcome = SyncOutcome::Downloaded {
                    at: copy.server_updated_at,
                };
                self.notify_completed(collection, key, outcome);
                Ok(outcome)
            }
        }
    }

    /// Run `op` until it succeeds or the retry ceiling is hit, each
    /// attempt bounded by the operation timeout.
    async fn retry<T, F, Fut>(&self, collection: &str, key: Uuid, op: F) -> SyncResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match timeout(self.config.op_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout {
                    duration_ms: self.config.op_timeout.as_millis() as u64,
                }),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= self.config.max_retries {
                        error!(
                            "sync of {}/{} abandoned after {} attempts: {}",
                            collection, key, attempt, e
                        );
                        let _ = self.notice_tx.try_send(SyncNotice::PersistentFailure {
                            collection: collection.to_string(),
                            key,
                            attempts: attempt,
                            error: e,
                        });
                        return Err(SyncError::RetriesExhausted { attempts: attempt });
                    }
                    let delay = backoff_delay(&self.config, attempt);
                    warn!(
                        "sync attempt {} for {}/{} failed ({}), retrying in {:?}",
                        attempt, collection, key, e, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    fn notify_completed(&self, collection: &str, key: Uuid, outcome: SyncOutcome) {
        let _ = self.notice_tx.try_send(SyncNotice::Completed {
            collection: collection.to_string(),
            key,
            outcome,
        });
    }
}

/// Handle to a running background scheduler.
pub struct SchedulerHandle {
    dirty_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Nudge the scheduler: an entity just went dirty.
    pub fn notify_dirty(&self) {
        let _ = self.dirty_tx.try_send(());
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn run_scheduler(
    engine: Arc<SyncEngine>,
    roster: Arc<dyn SyncRoster>,
    mut reach_rx: watch::Receiver<bool>,
    mut dirty_rx: mpsc::Receiver<()>,
) {
    let mut ticker = interval(engine.config.sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let wake = select! {
            event = dirty_rx.recv() => match event {
                Some(()) => "dirty entity",
                None => break,
            },
            result = reach_rx.changed() => {
                if result.is_err() {
                    break;
                }
                if !*reach_rx.borrow() {
                    continue;
                }
                "reachability restored"
            }
            _ = ticker.tick() => "interval",
        };

        if !*reach_rx.borrow() {
            debug!("skipping sync pass ({}): remote offline", wake);
            continue;
        }
        let summary = engine.sync_all_pending(roster.as_ref()).await;
        debug!(
            "sync pass ({}): {} attempted, {} confirmed, {} failed",
            wake, summary.attempted, summary.succeeded, summary.failed
        );
    }
    debug!("sync scheduler stopped");
}

/// Exponential backoff: base, 2x base, 4x base... capped at `max_backoff`.
fn backoff_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    config
        .base_backoff
        .saturating_mul(factor)
        .min(config.max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::remote::MockRemoteStore;
    use liftsync_utils::model::{PlanExercise, WorkoutPlan};
    use tokio::sync::Mutex;

    fn dirty_plan() -> WorkoutPlan {
        WorkoutPlan::new(
            "user-1".to_string(),
            "Pull Day".to_string(),
            vec![PlanExercise {
                template_name: "Row".to_string(),
                target_reps: 8,
                target_sets: 3,
                weight_kg: 50.0,
            }],
        )
    }

    fn engine_with(remote: Arc<MockRemoteStore>, config: SyncConfig) -> (SyncEngine, mpsc::Receiver<SyncNotice>) {
        SyncEngine::new(remote, config)
    }

    #[tokio::test]
    async fn test_clean_entity_triggers_zero_network_calls() {
        let remote = Arc::new(MockRemoteStore::new());
        let (engine, _notices) = engine_with(remote.clone(), SyncConfig::default());
        let mut plan = dirty_plan();
        plan.mark_synced(Utc::now());

        let outcome = engine.execute(&mut plan).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(remote.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_upload_clears_flag_with_server_timestamp() {
        let remote = Arc::new(MockRemoteStore::new());
        let (engine, _notices) = engine_with(remote.clone(), SyncConfig::default());
        let mut plan = dirty_plan();

        let outcome = engine.execute(&mut plan).await.unwrap();

        let at = match outcome {
            SyncOutcome::Uploaded { at } => at,
            other => panic!("expected upload, got {:?}", other),
        };
        assert!(!plan.needs_sync());
        assert_eq!(plan.last_synced_at(), Some(at));
        assert!(remote.document("workout_plans", plan.id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let remote = Arc::new(MockRemoteStore::new());
        remote.fail_next(2);
        let (engine, _notices) = engine_with(remote.clone(), SyncConfig::default());
        let mut plan = dirty_plan();

        engine.execute(&mut plan).await.unwrap();

        assert_eq!(remote.upload_count(), 3);
        assert!(!plan.needs_sync());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_surfaces_persistent_failure() {
        let remote = Arc::new(MockRemoteStore::new());
        remote.fail_next(100);
        let config = SyncConfig {
            max_retries: 3,
            ..Default::default()
        };
        let (engine, mut notices) = engine_with(remote.clone(), config);
        let mut plan = dirty_plan();

        let err = engine.execute(&mut plan).await.unwrap_err();

        assert_eq!(err, SyncError::RetriesExhausted { attempts: 3 });
        assert_eq!(remote.upload_count(), 3);
        assert!(plan.needs_sync());

        match notices.recv().await.unwrap() {
            SyncNotice::PersistentFailure { attempts, key, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(key, plan.id);
            }
            other => panic!("expected persistent failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_survives_individual_failures() {
        let remote = Arc::new(MockRemoteStore::new());
        let config = SyncConfig {
            max_retries: 1,
            ..Default::default()
        };
        let (engine, _notices) = engine_with(remote.clone(), config);
        let mut plans = vec![dirty_plan(), dirty_plan()];
        remote.fail_next(1);

        let reports = engine.execute_batch(&mut plans).await;

        assert_eq!(reports.len(), 2);
        assert!(reports[0].result.is_err());
        assert!(reports[1].result.is_ok());
        assert!(plans[0].needs_sync());
        assert!(!plans[1].needs_sync());
    }

    #[tokio::test]
    async fn test_delete_tombstones_by_identifier() {
        let remote = Arc::new(MockRemoteStore::new());
        let (engine, _notices) = engine_with(remote.clone(), SyncConfig::default());
        let key = Uuid::new_v4();
        remote
            .seed("workout_plans", key, serde_json::json!({"name": "x"}), Utc::now())
            .await;

        let outcome = engine.schedule_delete("workout_plans", key).await.unwrap();

        assert!(matches!(outcome, SyncOutcome::Deleted { .. }));
        assert!(remote.document("workout_plans", key).await.is_none());
    }

    #[tokio::test]
    async fn test_download_replaces_local_copy() {
        let remote = Arc::new(MockRemoteStore::new());
        let (engine, _notices) = engine_with(remote.clone(), SyncConfig::default());
        let mut plan = dirty_plan();
        let mut remote_plan = plan.clone();
        remote_plan.name = "Renamed Remotely".to_string();
        let seeded_at = Utc::now();
        remote
            .seed(
                "workout_plans",
                plan.id,
                serde_json::to_value(&remote_plan).unwrap(),
                seeded_at,
            )
            .await;

        let outcome = engine
            .execute_with(&mut plan, SyncStrategy::Download)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Downloaded { at: seeded_at });
        assert_eq!(plan.name, "Renamed Remotely");
        assert_eq!(plan.last_synced_at(), Some(seeded_at));
    }

    struct FixedRoster {
        jobs: Mutex<Vec<SyncJob>>,
        confirmed: Mutex<Vec<(String, Uuid)>>,
    }

    #[async_trait]
    impl SyncRoster for FixedRoster {
        async fn pending_uploads(&self) -> Vec<SyncJob> {
            self.jobs.lock().await.drain(..).collect()
        }

        async fn confirm(&self, collection: &str, key: Uuid, _at: DateTime<Utc>, _generation: u64) {
            self.confirmed
                .lock()
                .await
                .push((collection.to_string(), key));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_runs_pass_on_dirty_nudge() {
        let remote = Arc::new(MockRemoteStore::new());
        let (engine, _notices) = engine_with(remote.clone(), SyncConfig::default());
        let engine = Arc::new(engine);
        let key = Uuid::new_v4();
        let roster = Arc::new(FixedRoster {
            jobs: Mutex::new(vec![SyncJob {
                collection: "workout_history",
                key,
                body: serde_json::json!({"id": key}),
                generation: 0,
            }]),
            confirmed: Mutex::new(Vec::new()),
        });
        let (_reach_tx, reach_rx) = watch::channel(true);

        let handle = engine.spawn_scheduler(roster.clone(), reach_rx);
        handle.notify_dirty();

        while roster.confirmed.lock().await.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(remote.upload_count(), 1);
        assert_eq!(
            roster.confirmed.lock().await[0],
            ("workout_history".to_string(), key)
        );
        handle.abort();
    }

    #[test]
    fn test_backoff_is_strictly_increasing_until_cap() {
        let config = SyncConfig {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            ..Default::default()
        };

        let delays: Vec<_> = (1..=6).map(|a| backoff_delay(&config, a)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[5], Duration::from_secs(30));
    }
}
