// Host service
//
// Wires the session state machine, history migrator and sync engine behind
// one facade and routes inbound device messages to them. All hierarchy
// mutations go through a single async mutex, so a chunk arriving while a
// set is being closed can never interleave with it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use liftsync_utils::entity::Syncable;
use liftsync_utils::message::DeviceMessage;
use liftsync_utils::model::{WorkoutHistory, WorkoutPlan};
use liftsync_utils::transport::DeviceLink;

use crate::history::{HistoryMigrator, HistoryStore};
use crate::session::{
    ChunkDisposition, SessionError, SessionResult, SessionStateMachine, SessionTree,
};
use crate::sync::{SchedulerHandle, SyncEngine, SyncJob, SyncRoster};

pub struct HostService {
    machine: Mutex<SessionStateMachine>,
    migrator: HistoryMigrator,
    history: Arc<dyn HistoryStore>,
    engine: Arc<SyncEngine>,
    link: Arc<dyn DeviceLink>,
    plans: Mutex<HashMap<Uuid, WorkoutPlan>>,
    scheduler: std::sync::Mutex<Option<SchedulerHandle>>,
}

impl HostService {
    pub fn new(
        machine: SessionStateMachine,
        history: Arc<dyn HistoryStore>,
        engine: Arc<SyncEngine>,
        link: Arc<dyn DeviceLink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            machine: Mutex::new(machine),
            migrator: HistoryMigrator::new(history.clone()),
            history,
            engine,
            link,
            plans: Mutex::new(HashMap::new()),
            scheduler: std::sync::Mutex::new(None),
        })
    }

    /// Start the background sync scheduler. `reachability` is the cloud
    /// connectivity signal.
    pub fn start_sync(self: &Arc<Self>, reachability: watch::Receiver<bool>) {
        let roster: Arc<dyn SyncRoster> = self.clone();
        let handle = self.engine.spawn_scheduler(roster, reachability);
        if let Ok(mut slot) = self.scheduler.lock() {
            *slot = Some(handle);
        }
    }

    pub fn stop_sync(&self) {
        if let Ok(mut slot) = self.scheduler.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    /// Route one inbound device message. Command failures are logged, not
    /// raised: the sender is a remote device, not a local caller.
    pub async fn handle_message(&self, message: DeviceMessage) {
        match message {
            DeviceMessage::StartWorkout {
                user_id,
                plan_id,
                timestamp,
            } => {
                let at = from_epoch(timestamp);
                match Uuid::parse_str(&plan_id) {
                    Ok(plan) => {
                        self.log_command(self.start_workout(&user_id, plan, at).await.map(|_| ()))
                    }
                    Err(_) => warn!("start workout with bad plan id: {}", plan_id),
                }
            }
            DeviceMessage::EndWorkout { timestamp, .. } => {
                self.log_command(self.end_workout(from_epoch(timestamp)).await.map(|_| ()));
            }
            DeviceMessage::StartExercise {
                template_name,
                timestamp,
                ..
            } => {
                self.log_command(
                    self.start_exercise(&template_name, from_epoch(timestamp))
                        .await
                        .map(|_| ()),
                );
            }
            DeviceMessage::EndExercise { timestamp, .. } => {
                self.log_command(self.end_exercise(from_epoch(timestamp)).await.map(|_| ()));
            }
            DeviceMessage::StartSet {
                order,
                target_reps,
                weight_kg,
                timestamp,
                ..
            } => {
                self.log_command(
                    self.start_set(order, target_reps, weight_kg, from_epoch(timestamp))
                        .await
                        .map(|_| ()),
                );
            }
            DeviceMessage::EndSet {
                actual_reps,
                rest_secs,
                heart_rate_bpm,
                calories_kcal,
                timestamp,
                ..
            } => {
                self.log_command(
                    self.end_set(
                        actual_reps,
                        rest_secs,
                        heart_rate_bpm,
                        calories_kcal,
                        from_epoch(timestamp),
                    )
                    .await
                    .map(|_| ()),
                );
            }
            DeviceMessage::SensorData { chunks } => {
                self.apply_sensor_data(chunks).await;
            }
            DeviceMessage::Unknown => {
                debug!("ignoring unknown message type");
            }
            other => {
                debug!("ignoring wearable-bound message on host: {:?}", other);
            }
        }
    }

    /// Make a plan available for `startWorkout` and ship the current plan
    /// list to the wearable.
    pub async fn register_plan(&self, plan: WorkoutPlan) {
        let snapshot = {
            let mut plans = self.plans.lock().await;
            plans.insert(plan.id, plan);
            plans.values().cloned().collect::<Vec<_>>()
        };
        self.send_to_wearable(DeviceMessage::WorkoutPlans { plans: snapshot })
            .await;
    }

    /// Announce an authenticated user to the wearable.
    pub async fn set_authenticated(&self, user_id: &str) {
        self.send_to_wearable(DeviceMessage::AuthStatus {
            authenticated: true,
            user_id: Some(user_id.to_string()),
        })
        .await;
    }

    pub async fn start_workout(
        &self,
        user_id: &str,
        plan_id: Uuid,
        at: DateTime<Utc>,
    ) -> SessionResult<Uuid> {
        let plan = self
            .plans
            .lock()
            .await
            .get(&plan_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownPlan {
                plan_id: plan_id.to_string(),
            })?;
        let id = self.machine.lock().await.start_session(user_id, plan, at)?;
        self.publish_context().await;
        self.nudge_sync();
        Ok(id)
    }

    pub async fn start_exercise(
        &self,
        template_name: &str,
        at: DateTime<Utc>,
    ) -> SessionResult<Uuid> {
        let id = self.machine.lock().await.start_exercise(template_name, at)?;
        self.publish_context().await;
        self.nudge_sync();
        Ok(id)
    }

    pub async fn start_set(
        &self,
        order: i64,
        target_reps: i64,
        weight_kg: f64,
        at: DateTime<Utc>,
    ) -> SessionResult<Uuid> {
        let id = self
            .machine
            .lock()
            .await
            .start_set(order, target_reps, weight_kg, at)?;
        self.publish_context().await;
        self.nudge_sync();
        Ok(id)
    }

    pub async fn end_set(
        &self,
        actual_reps: u32,
        rest_secs: f64,
        heart_rate_bpm: Option<f64>,
        calories_kcal: Option<f64>,
        at: DateTime<Utc>,
    ) -> SessionResult<Uuid> {
        let id = self.machine.lock().await.end_set(
            actual_reps,
            rest_secs,
            heart_rate_bpm,
            calories_kcal,
            at,
        )?;
        self.publish_context().await;
        self.nudge_sync();
        Ok(id)
    }

    pub async fn end_exercise(&self, at: DateTime<Utc>) -> SessionResult<Uuid> {
        let id = self.machine.lock().await.end_exercise(at)?;
        self.publish_context().await;
        self.nudge_sync();
        Ok(id)
    }

    /// End the active session: halt capture on the wearable, migrate the
    /// hierarchy to history, then delete it and wake the sync engine.
    ///
    /// If migration fails the hierarchy survives untouched and the call
    /// can be repeated.
    pub async fn end_workout(&self, at: DateTime<Utc>) -> SessionResult<WorkoutHistory> {
        let mut machine = self.machine.lock().await;
        let tree = machine.end_workout(at)?;

        // Stop the wearable's capture before the source can be deleted;
        // the machine lock keeps concurrent chunks queued meanwhile.
        self.send_to_wearable(DeviceMessage::SessionEnd {
            session_id: tree.session.id.to_string(),
            timestamp: to_epoch(at),
        })
        .await;

        let history = self
            .migrator
            .migrate(&tree)
            .await
            .map_err(|e| SessionError::MigrationFailed(e.to_string()))?;
        machine.clear();
        drop(machine);

        self.purge_remote_in_progress(&tree);
        self.nudge_sync();
        Ok(history)
    }

    /// Tombstone the in-progress documents a finished session left in the
    /// cloud store. History is the durable record of the workout; the
    /// per-session `sessions`/`exercises`/`sets` documents are deleted in
    /// the background once migration has committed.
    fn purge_remote_in_progress(&self, tree: &SessionTree) {
        let engine = self.engine.clone();
        let session_id = tree.session.id;
        let mut exercise_ids = Vec::with_capacity(tree.exercises.len());
        let mut set_ids = Vec::new();
        for (exercise, sets) in &tree.exercises {
            exercise_ids.push(exercise.id);
            set_ids.extend(sets.iter().map(|s| s.id));
        }
        tokio::spawn(async move {
            if let Err(e) = engine.schedule_delete("sessions", session_id).await {
                warn!("could not tombstone session {}: {}", session_id, e);
            }
            for id in exercise_ids {
                if let Err(e) = engine.schedule_delete("exercises", id).await {
                    warn!("could not tombstone exercise {}: {}", id, e);
                }
            }
            for id in set_ids {
                if let Err(e) = engine.schedule_delete("sets", id).await {
                    warn!("could not tombstone set {}: {}", id, e);
                }
            }
        });
    }

    /// Cancel everything for a signed-out user. A still-active session is
    /// ended and migrated if possible, but local state is cleared even
    /// when that fails: identity is gone either way.
    pub async fn logout(&self, at: DateTime<Utc>) {
        let active = self
            .machine
            .lock()
            .await
            .session()
            .map(|s| s.active)
            .unwrap_or(false);
        if active {
            if let Err(e) = self.end_workout(at).await {
                warn!("logout: could not finish active session: {}", e);
            }
        }
        self.machine.lock().await.clear();
        self.plans.lock().await.clear();
        self.send_to_wearable(DeviceMessage::AuthStatus {
            authenticated: false,
            user_id: None,
        })
        .await;
        info!("logged out, local session state cleared");
    }

    pub async fn session_active(&self) -> bool {
        self.machine
            .lock()
            .await
            .session()
            .map(|s| s.active)
            .unwrap_or(false)
    }

    async fn apply_sensor_data(&self, chunks: Vec<liftsync_utils::message::ChunkEnvelope>) {
        let mut machine = self.machine.lock().await;
        for envelope in chunks {
            let chunk = match envelope.to_chunk() {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("undecodable sensor chunk discarded: {}", e);
                    continue;
                }
            };
            match machine.apply_sensor_chunk(&chunk) {
                Ok(ChunkDisposition::Merged { samples }) => {
                    debug!("chunk {} merged ({} samples)", chunk.sequence, samples)
                }
                Ok(disposition) => {
                    debug!("chunk {}: {:?}", chunk.sequence, disposition)
                }
                Err(e) => warn!("chunk {} failed to merge: {}", chunk.sequence, e),
            }
        }
    }

    /// Mirror the current hierarchy to the wearable so it tags samples
    /// with the right identifiers. Best-effort; the next mutation will
    /// publish a fresh snapshot anyway.
    async fn publish_context(&self) {
        let context = self.machine.lock().await.current_context();
        if let Some(context) = context {
            let phase = if context.set_open { "execution" } else { "rest" };
            self.send_to_wearable(DeviceMessage::SessionContext {
                session_id: context.session_id.to_string(),
                exercise_id: context.exercise_id.map(|id| id.to_string()),
                set_id: context.set_id.filter(|_| context.set_open).map(|id| id.to_string()),
                phase: phase.to_string(),
                timestamp: to_epoch(Utc::now()),
            })
            .await;
        }
    }

    async fn send_to_wearable(&self, message: DeviceMessage) {
        if let Err(e) = self.link.send(message).await {
            warn!("wearable send failed: {}", e);
        }
    }

    fn nudge_sync(&self) {
        if let Ok(slot) = self.scheduler.lock() {
            if let Some(handle) = slot.as_ref() {
                handle.notify_dirty();
            }
        }
    }

    fn log_command(&self, result: SessionResult<()>) {
        if let Err(e) = result {
            warn!("device command rejected: {}", e);
        }
    }
}

#[async_trait]
impl SyncRoster for HostService {
    async fn pending_uploads(&self) -> Vec<SyncJob> {
        let mut jobs = self.machine.lock().await.dirty_jobs();
        match self.history.dirty().await {
            Ok(histories) => {
                for history in histories {
                    match serde_json::to_value(&history) {
                        Ok(body) => jobs.push(SyncJob {
                            collection: history.collection(),
                            key: history.entity_id(),
                            body,
                            generation: history.sync_generation(),
                        }),
                        Err(e) => warn!("history {} not serializable: {}", history.id, e),
                    }
                }
            }
            Err(e) => warn!("could not list dirty history: {}", e),
        }
        jobs
    }

    async fn confirm(&self, collection: &str, key: Uuid, at: DateTime<Utc>, generation: u64) {
        if collection == "workout_history" {
            if let Err(e) = self.history.confirm_synced(key, at, generation).await {
                warn!("could not confirm history {}: {}", key, e);
            }
        } else {
            self.machine
                .lock()
                .await
                .confirm_synced(collection, key, at, generation);
        }
    }
}

fn to_epoch(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1_000.0
}

fn from_epoch(ts: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis((ts * 1_000.0) as i64).unwrap_or_else(Utc::now)
}
