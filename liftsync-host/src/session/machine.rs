// Session state machine
//
// Canonical owner of the in-progress Session -> Exercise -> Set hierarchy.
// Entities live in arenas keyed by id; parent/child links are plain id
// fields and the machine alone maintains graph integrity. Lifecycle
// transitions come only from explicit operations; sensor data never drives
// a transition, it only extends the payload of the currently open set.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use uuid::Uuid;

use liftsync_utils::chunk::SensorChunk;
use liftsync_utils::codec::SensorPayload;
use liftsync_utils::entity::Syncable;
use liftsync_utils::model::{ExerciseRecord, SessionRecord, SetRecord, WorkoutPlan};

use super::error::{SessionError, SessionResult};
use crate::sync::SyncJob;

/// Supplies tier limits. Entitlement resolution itself is an external
/// collaborator; the machine only consumes the resulting cap.
pub trait Entitlements: Send + Sync {
    /// Maximum sets per exercise for this user, `None` for no cap.
    fn max_sets_per_exercise(&self, user_id: &str) -> Option<u32>;
}

/// No caps; the paid tier and tests.
pub struct Unrestricted;

impl Entitlements for Unrestricted {
    fn max_sets_per_exercise(&self, _user_id: &str) -> Option<u32> {
        None
    }
}

/// A flat cap regardless of user; the free tier.
pub struct FixedSetCap(pub u32);

impl Entitlements for FixedSetCap {
    fn max_sets_per_exercise(&self, _user_id: &str) -> Option<u32> {
        Some(self.0)
    }
}

/// What became of a sensor chunk handed to the machine.
///
/// Everything except `Merged` is a silent drop: stale, duplicate and
/// mistargeted chunks are an expected consequence of best-effort
/// transport, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDisposition {
    /// Samples appended to the open set's payload.
    Merged { samples: usize },
    /// This sequence number was already merged into the set.
    Duplicate,
    /// No open set matched the chunk's identifiers.
    Dropped,
}

/// Identifiers of the current hierarchy, published to the wearable after
/// every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub session_id: Uuid,
    pub exercise_id: Option<Uuid>,
    pub set_id: Option<Uuid>,
    /// Whether `set_id` refers to a set still accepting samples.
    pub set_open: bool,
}

/// The finalized hierarchy handed to the history migrator.
///
/// A snapshot, not live state: the machine's own records stay untouched
/// until [`SessionStateMachine::clear`], so a failed migration leaves the
/// source intact for retry.
#[derive(Debug, Clone)]
pub struct SessionTree {
    pub session: SessionRecord,
    /// Exercises in start order, each with its sets in start order.
    pub exercises: Vec<(ExerciseRecord, Vec<SetRecord>)>,
}

pub struct SessionStateMachine {
    entitlements: Box<dyn Entitlements>,
    session: Option<SessionRecord>,
    plan: Option<WorkoutPlan>,
    exercises: HashMap<Uuid, ExerciseRecord>,
    sets: HashMap<Uuid, SetRecord>,
    /// Exercise ids in start order.
    exercise_order: Vec<Uuid>,
    /// Set ids in start order, across exercises.
    set_order: Vec<Uuid>,
}

impl SessionStateMachine {
    pub fn new(entitlements: Box<dyn Entitlements>) -> Self {
        Self {
            entitlements,
            session: None,
            plan: None,
            exercises: HashMap::new(),
            sets: HashMap::new(),
            exercise_order: Vec::new(),
            set_order: Vec::new(),
        }
    }

    pub fn session(&self) -> Option<&SessionRecord> {
        self.session.as_ref()
    }

    pub fn plan(&self) -> Option<&WorkoutPlan> {
        self.plan.as_ref()
    }

    /// Sets without an end time, across all exercises. Never exceeds one.
    pub fn open_set_count(&self) -> usize {
        self.sets.values().filter(|s| s.is_open()).count()
    }

    pub fn current_context(&self) -> Option<ContextSnapshot> {
        let session = self.session.as_ref()?;
        let set_id = session
            .current_exercise
            .and_then(|e| self.exercises.get(&e))
            .and_then(|e| e.current_set);
        Some(ContextSnapshot {
            session_id: session.id,
            exercise_id: session.current_exercise,
            set_id,
            set_open: set_id
                .and_then(|id| self.sets.get(&id))
                .map(|s| s.is_open())
                .unwrap_or(false),
        })
    }

    /// Begin a session for `user_id` executing `plan`.
    ///
    /// Fails while any session is active: the old session is never
    /// orphaned in favor of a new one.
    pub fn start_session(
        &mut self,
        user_id: &str,
        plan: WorkoutPlan,
        at: DateTime<Utc>,
    ) -> SessionResult<Uuid> {
        if let Some(existing) = &self.session {
            if existing.active {
                return Err(SessionError::SessionAlreadyActive {
                    user_id: existing.user_id.clone(),
                });
            }
        }
        let session = SessionRecord::new(user_id.to_string(), plan.id, at);
        let id = session.id;
        info!(
            "session {} started for user {} on plan {}",
            id, user_id, plan.name
        );
        self.session = Some(session);
        self.plan = Some(plan);
        Ok(id)
    }

    /// Begin the next exercise. Any previously active exercise is
    /// finalized first, along with its open set if it has one.
    pub fn start_exercise(
        &mut self,
        template_name: &str,
        at: DateTime<Utc>,
    ) -> SessionResult<Uuid> {
        let session = match self.session.as_ref() {
            Some(s) if s.active => s,
            _ => return Err(SessionError::SessionNotActive),
        };
        let plan = self.plan.as_ref().ok_or(SessionError::SessionNotActive)?;
        if plan.exercise_at(session.exercise_index).is_none() {
            return Err(SessionError::PlanExhausted {
                plan: plan.name.clone(),
            });
        }

        self.finalize_current_exercise(at);

        let session = self.session.as_mut().ok_or(SessionError::SessionNotActive)?;
        let exercise = ExerciseRecord::new(session.id, template_name.to_string(), at);
        let id = exercise.id;
        session.exercise_index += 1;
        session.current_exercise = Some(id);
        session.mark_dirty();
        self.exercise_order.push(id);
        self.exercises.insert(id, exercise);
        debug!("exercise {} ({}) started", id, template_name);
        Ok(id)
    }

    /// Open a set in the active exercise. A set still open in the same
    /// exercise is finalized at `at` first; at most one set is ever open.
    pub fn start_set(
        &mut self,
        order: i64,
        target_reps: i64,
        weight_kg: f64,
        at: DateTime<Utc>,
    ) -> SessionResult<Uuid> {
        let session = match self.session.as_ref() {
            Some(s) if s.active => s,
            _ => return Err(SessionError::SessionNotActive),
        };
        let exercise_id = session
            .current_exercise
            .filter(|id| self.exercises.get(id).map(|e| e.active).unwrap_or(false))
            .ok_or(SessionError::NoActiveExercise)?;

        if order < 0 {
            return Err(SessionError::InvalidSetOrder { order });
        }
        if target_reps <= 0 {
            return Err(SessionError::InvalidTargetReps { target_reps });
        }
        if weight_kg < 0.0 || !weight_kg.is_finite() {
            return Err(SessionError::InvalidWeight { weight_kg });
        }
        if let Some(limit) = self.entitlements.max_sets_per_exercise(&session.user_id) {
            let done = self.exercises[&exercise_id].set_index as u32;
            if done >= limit {
                return Err(SessionError::SetLimitExceeded { limit });
            }
        }

        self.close_open_set(at);

        let set = SetRecord::new(exercise_id, order as u32, target_reps as u32, weight_kg, at);
        let id = set.id;
        let exercise = self
            .exercises
            .get_mut(&exercise_id)
            .ok_or(SessionError::NoActiveExercise)?;
        exercise.set_index += 1;
        exercise.current_set = Some(id);
        exercise.mark_dirty();
        self.set_order.push(id);
        self.sets.insert(id, set);
        debug!("set {} opened (order {}, target {})", id, order, target_reps);
        Ok(id)
    }

    /// Merge a chunk's samples into the open set it is tagged for.
    ///
    /// Chunks that miss the open set (stale session, closed or unknown
    /// set) and chunks whose sequence number was already merged are
    /// dropped without error. Duplicate delivery is therefore idempotent:
    /// applying the same chunk twice leaves the payload as one apply did.
    pub fn apply_sensor_chunk(&mut self, chunk: &SensorChunk) -> SessionResult<ChunkDisposition> {
        let session = match self.session.as_ref() {
            Some(s) if s.active => s,
            _ => {
                debug!("chunk {} dropped: no active session", chunk.sequence);
                return Ok(ChunkDisposition::Dropped);
            }
        };
        if session.id != chunk.session_id {
            debug!("chunk {} dropped: stale session id", chunk.sequence);
            return Ok(ChunkDisposition::Dropped);
        }
        let set = match self.sets.get_mut(&chunk.set_id) {
            Some(s) if s.is_open() => s,
            _ => {
                debug!("chunk {} dropped: no matching open set", chunk.sequence);
                return Ok(ChunkDisposition::Dropped);
            }
        };
        if set.applied_chunks.contains(&chunk.sequence) {
            debug!("chunk {} already merged into set {}", chunk.sequence, set.id);
            return Ok(ChunkDisposition::Duplicate);
        }

        // Merge into a temporary and assign only on success, so a codec
        // failure cannot destroy the samples already accumulated.
        let mut merged = SensorPayload::from_bytes_unchecked(set.sensor_payload.clone())?;
        merged.append_samples(&chunk.samples)?;
        set.sensor_payload = merged.into_bytes();
        set.applied_chunks.insert(chunk.sequence);
        set.mark_dirty();
        Ok(ChunkDisposition::Merged {
            samples: chunk.samples.len(),
        })
    }

    /// Close the open set, recording the performed reps and rest.
    pub fn end_set(
        &mut self,
        actual_reps: u32,
        rest_secs: f64,
        heart_rate_bpm: Option<f64>,
        calories_kcal: Option<f64>,
        at: DateTime<Utc>,
    ) -> SessionResult<Uuid> {
        let set_id = self
            .open_set_id()
            .ok_or(SessionError::NoOpenSet)?;
        let set = self.sets.get_mut(&set_id).ok_or(SessionError::NoOpenSet)?;
        set.actual_reps = Some(actual_reps);
        set.rest_secs = Some(rest_secs);
        set.heart_rate_bpm = heart_rate_bpm;
        set.calories_kcal = calories_kcal;
        set.ended_at = Some(at);
        set.mark_dirty();
        debug!("set {} closed ({} reps)", set_id, actual_reps);
        Ok(set_id)
    }

    /// End the active exercise. Its open set, if any, is closed at `at`.
    /// Does not advance to the next exercise; the caller decides.
    pub fn end_exercise(&mut self, at: DateTime<Utc>) -> SessionResult<Uuid> {
        let session = match self.session.as_ref() {
            Some(s) if s.active => s,
            _ => return Err(SessionError::SessionNotActive),
        };
        let exercise_id = session
            .current_exercise
            .filter(|id| self.exercises.get(id).map(|e| e.active).unwrap_or(false))
            .ok_or(SessionError::NoActiveExercise)?;

        self.close_open_set(at);
        if let Some(exercise) = self.exercises.get_mut(&exercise_id) {
            exercise.ended_at = Some(at);
            exercise.active = false;
            exercise.current_set = None;
            exercise.mark_dirty();
        }
        if let Some(session) = self.session.as_mut() {
            session.current_exercise = None;
            session.mark_dirty();
        }
        debug!("exercise {} ended", exercise_id);
        Ok(exercise_id)
    }

    /// Produce the finalized hierarchy for migration.
    ///
    /// Still-open sets and still-active exercises are finalized at `at`
    /// in the returned snapshot only. The stored records are untouched:
    /// the caller invokes [`clear`] once migration has committed, and a
    /// failed migration can simply retry this operation.
    ///
    /// [`clear`]: SessionStateMachine::clear
    pub fn end_workout(&self, at: DateTime<Utc>) -> SessionResult<SessionTree> {
        let session = match self.session.as_ref() {
            Some(s) if s.active => s,
            _ => return Err(SessionError::SessionNotActive),
        };

        let mut finalized = session.clone();
        finalized.ended_at = Some(at);
        finalized.active = false;
        finalized.current_exercise = None;

        let mut exercises = Vec::with_capacity(self.exercise_order.len());
        for exercise_id in &self.exercise_order {
            let mut exercise = self.exercises[exercise_id].clone();
            if exercise.active {
                exercise.ended_at = Some(at);
                exercise.active = false;
                exercise.current_set = None;
            }
            let sets = self
                .set_order
                .iter()
                .filter_map(|id| self.sets.get(id))
                .filter(|s| s.exercise_id == *exercise_id)
                .map(|s| {
                    let mut set = s.clone();
                    if set.is_open() {
                        set.ended_at = Some(at);
                    }
                    set
                })
                .collect();
            exercises.push((exercise, sets));
        }

        info!(
            "session {} finalized with {} exercises",
            finalized.id,
            exercises.len()
        );
        Ok(SessionTree {
            session: finalized,
            exercises,
        })
    }

    /// Delete the whole in-progress hierarchy. Called only after its
    /// migrated history has been durably committed.
    pub fn clear(&mut self) {
        if let Some(session) = &self.session {
            info!("clearing migrated session {}", session.id);
        }
        self.session = None;
        self.plan = None;
        self.exercises.clear();
        self.sets.clear();
        self.exercise_order.clear();
        self.set_order.clear();
    }

    /// Snapshot every dirty entity as an upload job for the sync engine.
    pub fn dirty_jobs(&self) -> Vec<SyncJob> {
        let mut jobs = Vec::new();
        if let Some(session) = self.session.as_ref().filter(|s| s.needs_sync()) {
            push_job(&mut jobs, session);
        }
        for id in &self.exercise_order {
            if let Some(exercise) = self.exercises.get(id).filter(|e| e.needs_sync()) {
                push_job(&mut jobs, exercise);
            }
        }
        for id in &self.set_order {
            if let Some(set) = self.sets.get(id).filter(|s| s.needs_sync()) {
                push_job(&mut jobs, set);
            }
        }
        jobs
    }

    /// Record a confirmed remote write for one of this machine's entities.
    /// Unknown keys are ignored; the entity may have been cleared since
    /// the upload was snapshotted. `generation` is the dirty generation
    /// the upload snapshotted; a record mutated since then (a merged
    /// chunk, a closed set) stays dirty so the next pass re-uploads it.
    pub fn confirm_synced(&mut self, collection: &str, key: Uuid, at: DateTime<Utc>, generation: u64) {
        let cleared = match collection {
            "sessions" => self
                .session
                .as_mut()
                .filter(|s| s.id == key)
                .map(|s| s.sync.mark_synced_at_generation(at, generation)),
            "exercises" => self
                .exercises
                .get_mut(&key)
                .map(|e| e.sync.mark_synced_at_generation(at, generation)),
            "sets" => self
                .sets
                .get_mut(&key)
                .map(|s| s.sync.mark_synced_at_generation(at, generation)),
            other => {
                debug!("sync confirmation for foreign collection {}", other);
                return;
            }
        };
        if cleared == Some(false) {
            debug!(
                "{}/{} mutated since its upload snapshot, staying dirty",
                collection, key
            );
        }
    }

    fn open_set_id(&self) -> Option<Uuid> {
        let session = self.session.as_ref().filter(|s| s.active)?;
        let exercise = self.exercises.get(&session.current_exercise?)?;
        let set_id = exercise.current_set?;
        self.sets
            .get(&set_id)
            .filter(|s| s.is_open())
            .map(|s| s.id)
    }

    fn close_open_set(&mut self, at: DateTime<Utc>) {
        if let Some(set_id) = self.open_set_id() {
            if let Some(set) = self.sets.get_mut(&set_id) {
                warn!("set {} force-closed without an explicit end", set_id);
                set.ended_at = Some(at);
                set.mark_dirty();
            }
            if let Some(exercise) = set_exercise_mut(&mut self.exercises, &self.sets, set_id) {
                exercise.current_set = None;
            }
        }
    }

    fn finalize_current_exercise(&mut self, at: DateTime<Utc>) {
        self.close_open_set(at);
        let current = self.session.as_ref().and_then(|s| s.current_exercise);
        if let Some(exercise) = current.and_then(|id| self.exercises.get_mut(&id)) {
            if exercise.active {
                exercise.ended_at = Some(at);
                exercise.active = false;
                exercise.current_set = None;
                exercise.mark_dirty();
            }
        }
    }
}

fn set_exercise_mut<'a>(
    exercises: &'a mut HashMap<Uuid, ExerciseRecord>,
    sets: &HashMap<Uuid, SetRecord>,
    set_id: Uuid,
) -> Option<&'a mut ExerciseRecord> {
    let exercise_id = sets.get(&set_id)?.exercise_id;
    exercises.get_mut(&exercise_id)
}

fn push_job<E: Syncable + serde::Serialize>(jobs: &mut Vec<SyncJob>, entity: &E) {
    match serde_json::to_value(entity) {
        Ok(body) => jobs.push(SyncJob {
            collection: entity.collection(),
            key: entity.entity_id(),
            body,
            generation: entity.sync_generation(),
        }),
        Err(e) => warn!(
            "entity {} in {} not serializable: {}",
            entity.entity_id(),
            entity.collection(),
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftsync_utils::model::PlanExercise;
    use liftsync_utils::sample::{SensorSample, Vec3};

    fn plan(exercises: usize) -> WorkoutPlan {
        WorkoutPlan::new(
            "user-1".to_string(),
            "Push Day".to_string(),
            (0..exercises)
                .map(|i| PlanExercise {
                    template_name: format!("Movement {}", i),
                    target_sets: 3,
                    target_reps: 8,
                    weight_kg: 60.0,
                })
                .collect(),
        )
    }

    fn machine() -> SessionStateMachine {
        SessionStateMachine::new(Box::new(Unrestricted))
    }

    fn samples(n: usize) -> Vec<SensorSample> {
        (0..n)
            .map(|i| {
                let mut s = SensorSample::at(i as f64 * 0.02);
                s.acceleration = Some(Vec3::new(0.1, -9.8, 0.0));
                s
            })
            .collect()
    }

    fn chunk(session: Uuid, set: Uuid, sequence: u64, n: usize) -> SensorChunk {
        SensorChunk::with_samples(session, set, sequence, samples(n))
    }

    #[test]
    fn test_second_session_fails_while_first_is_active() {
        let mut m = machine();
        m.start_session("user-1", plan(2), Utc::now()).unwrap();

        let err = m.start_session("user-1", plan(2), Utc::now()).unwrap_err();
        assert!(matches!(err, SessionError::SessionAlreadyActive { .. }));

        // After end + clear a new session is allowed again
        m.end_workout(Utc::now()).unwrap();
        m.clear();
        m.start_session("user-1", plan(2), Utc::now()).unwrap();
    }

    #[test]
    fn test_start_set_without_exercise_leaves_hierarchy_unchanged() {
        let mut m = machine();
        m.start_session("user-1", plan(1), Utc::now()).unwrap();

        let err = m.start_set(0, 10, 20.0, Utc::now()).unwrap_err();
        assert!(matches!(err, SessionError::NoActiveExercise));
        assert_eq!(m.open_set_count(), 0);
        assert!(m.current_context().unwrap().exercise_id.is_none());
    }

    #[test]
    fn test_start_set_validates_arguments() {
        let mut m = machine();
        m.start_session("user-1", plan(1), Utc::now()).unwrap();
        m.start_exercise("Bench Press", Utc::now()).unwrap();

        assert!(matches!(
            m.start_set(-1, 10, 20.0, Utc::now()),
            Err(SessionError::InvalidSetOrder { order: -1 })
        ));
        assert!(matches!(
            m.start_set(0, 0, 20.0, Utc::now()),
            Err(SessionError::InvalidTargetReps { .. })
        ));
        assert!(matches!(
            m.start_set(0, 10, -5.0, Utc::now()),
            Err(SessionError::InvalidWeight { .. })
        ));
        assert!(matches!(
            m.start_set(0, 10, f64::NAN, Utc::now()),
            Err(SessionError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn test_set_limit_enforced_by_entitlements() {
        let mut m = SessionStateMachine::new(Box::new(FixedSetCap(2)));
        m.start_session("user-1", plan(1), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();

        m.start_set(0, 10, 20.0, Utc::now()).unwrap();
        m.end_set(10, 60.0, None, None, Utc::now()).unwrap();
        m.start_set(1, 10, 20.0, Utc::now()).unwrap();
        m.end_set(10, 60.0, None, None, Utc::now()).unwrap();

        let err = m.start_set(2, 10, 20.0, Utc::now()).unwrap_err();
        assert!(matches!(err, SessionError::SetLimitExceeded { limit: 2 }));
    }

    #[test]
    fn test_plan_exhaustion_blocks_extra_exercise() {
        let mut m = machine();
        m.start_session("user-1", plan(1), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();
        m.end_exercise(Utc::now()).unwrap();

        let err = m.start_exercise("Deadlift", Utc::now()).unwrap_err();
        assert!(matches!(err, SessionError::PlanExhausted { .. }));
    }

    #[test]
    fn test_at_most_one_open_set() {
        let mut m = machine();
        m.start_session("user-1", plan(2), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();
        m.start_set(0, 10, 20.0, Utc::now()).unwrap();
        assert_eq!(m.open_set_count(), 1);

        // Starting another set force-closes the first
        m.start_set(1, 10, 20.0, Utc::now()).unwrap();
        assert_eq!(m.open_set_count(), 1);

        // Starting another exercise closes the stray set too
        m.start_exercise("Bench Press", Utc::now()).unwrap();
        m.start_set(0, 8, 40.0, Utc::now()).unwrap();
        assert_eq!(m.open_set_count(), 1);
    }

    #[test]
    fn test_chunk_merge_is_idempotent() {
        let mut m = machine();
        let session = m.start_session("user-1", plan(1), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();
        let set = m.start_set(0, 10, 20.0, Utc::now()).unwrap();

        let c = chunk(session, set, 0, 100);
        assert_eq!(
            m.apply_sensor_chunk(&c).unwrap(),
            ChunkDisposition::Merged { samples: 100 }
        );
        let once = m.sets[&set].sensor_payload.clone();

        assert_eq!(m.apply_sensor_chunk(&c).unwrap(), ChunkDisposition::Duplicate);
        assert_eq!(m.sets[&set].sensor_payload, once);
    }

    #[test]
    fn test_mismatched_chunk_is_dropped_silently() {
        let mut m = machine();
        let session = m.start_session("user-1", plan(1), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();
        let set = m.start_set(0, 10, 20.0, Utc::now()).unwrap();
        m.apply_sensor_chunk(&chunk(session, set, 0, 10)).unwrap();
        let before = m.sets[&set].sensor_payload.clone();

        // Wrong set id
        let stray = chunk(session, Uuid::new_v4(), 1, 10);
        assert_eq!(m.apply_sensor_chunk(&stray).unwrap(), ChunkDisposition::Dropped);

        // Right set id, wrong session id
        let stale = chunk(Uuid::new_v4(), set, 2, 10);
        assert_eq!(m.apply_sensor_chunk(&stale).unwrap(), ChunkDisposition::Dropped);

        assert_eq!(m.sets[&set].sensor_payload, before);
    }

    #[test]
    fn test_late_chunk_after_end_set_is_dropped() {
        let mut m = machine();
        let session = m.start_session("user-1", plan(1), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();
        let set = m.start_set(0, 10, 20.0, Utc::now()).unwrap();
        m.end_set(10, 60.0, None, None, Utc::now()).unwrap();

        let late = chunk(session, set, 0, 10);
        assert_eq!(m.apply_sensor_chunk(&late).unwrap(), ChunkDisposition::Dropped);
        assert!(m.sets[&set].sensor_payload.is_empty());
    }

    #[test]
    fn test_end_set_records_measurements() {
        let mut m = machine();
        m.start_session("user-1", plan(1), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();
        let set = m.start_set(0, 10, 20.0, Utc::now()).unwrap();

        m.end_set(9, 45.0, Some(132.0), Some(8.5), Utc::now()).unwrap();

        let record = &m.sets[&set];
        assert_eq!(record.actual_reps, Some(9));
        assert_eq!(record.rest_secs, Some(45.0));
        assert_eq!(record.heart_rate_bpm, Some(132.0));
        assert!(!record.is_open());

        assert!(matches!(
            m.end_set(9, 45.0, None, None, Utc::now()),
            Err(SessionError::NoOpenSet)
        ));
    }

    #[test]
    fn test_end_workout_finalizes_snapshot_and_preserves_source() {
        let mut m = machine();
        m.start_session("user-1", plan(2), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();
        m.start_set(0, 10, 20.0, Utc::now()).unwrap();

        let end = Utc::now();
        let tree = m.end_workout(end).unwrap();

        assert_eq!(tree.session.ended_at, Some(end));
        assert!(!tree.session.active);
        assert_eq!(tree.exercises.len(), 1);
        let (exercise, sets) = &tree.exercises[0];
        assert_eq!(exercise.ended_at, Some(end));
        assert_eq!(sets[0].ended_at, Some(end));

        // Source untouched until clear(), so a failed migration can retry
        assert!(m.session().unwrap().active);
        assert_eq!(m.open_set_count(), 1);
        m.end_workout(end).unwrap();
    }

    #[test]
    fn test_end_workout_requires_active_session() {
        let m = machine();
        assert!(matches!(
            m.end_workout(Utc::now()),
            Err(SessionError::SessionNotActive)
        ));
    }

    #[test]
    fn test_dirty_jobs_and_confirmation() {
        let mut m = machine();
        let session = m.start_session("user-1", plan(1), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();
        m.start_set(0, 10, 20.0, Utc::now()).unwrap();

        let jobs = m.dirty_jobs();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().any(|j| j.collection == "sessions" && j.key == session));

        let now = Utc::now();
        for job in &jobs {
            m.confirm_synced(job.collection, job.key, now, job.generation);
        }
        assert!(m.dirty_jobs().is_empty());
        assert_eq!(m.session().unwrap().last_synced_at(), Some(now));
    }

    #[test]
    fn test_ack_for_stale_snapshot_keeps_mutated_set_dirty() {
        let mut m = machine();
        let session = m.start_session("user-1", plan(1), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();
        let set = m.start_set(0, 10, 20.0, Utc::now()).unwrap();

        let jobs = m.dirty_jobs();

        // Samples arrive while the upload is in flight
        m.apply_sensor_chunk(&chunk(session, set, 0, 100)).unwrap();

        let now = Utc::now();
        for job in &jobs {
            m.confirm_synced(job.collection, job.key, now, job.generation);
        }

        // The set mutated after its snapshot, so it must be re-uploaded
        let remaining = m.dirty_jobs();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].collection, "sets");
        assert_eq!(remaining[0].key, set);

        // The fresh snapshot's ack does clear it
        m.confirm_synced("sets", set, now, remaining[0].generation);
        assert!(m.dirty_jobs().is_empty());
    }

    #[test]
    fn test_failed_merge_preserves_accumulated_payload() {
        let mut m = machine();
        let session = m.start_session("user-1", plan(1), Utc::now()).unwrap();
        m.start_exercise("Squat", Utc::now()).unwrap();
        let set = m.start_set(0, 10, 20.0, Utc::now()).unwrap();
        m.apply_sensor_chunk(&chunk(session, set, 0, 10)).unwrap();

        // Corrupt the version byte so the next merge fails
        m.sets.get_mut(&set).unwrap().sensor_payload[0] = 99;
        let before = m.sets[&set].sensor_payload.clone();

        let err = m.apply_sensor_chunk(&chunk(session, set, 1, 10)).unwrap_err();
        assert!(matches!(err, SessionError::Codec(_)));
        assert_eq!(m.sets[&set].sensor_payload, before);
        assert!(!m.sets[&set].applied_chunks.contains(&1));
    }
}
