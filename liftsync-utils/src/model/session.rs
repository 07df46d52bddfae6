// In-progress session records
//
// Arena-friendly records: entities reference each other by identifier only
// (parent id on the child, current-child id on the parent). Graph integrity
// is owned by the host's session state machine, never by the records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::entity::{SyncState, Syncable};

/// The single in-progress workout session owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub plan_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Index of the currently active exercise within the plan.
    pub exercise_index: usize,
    pub active: bool,
    pub current_exercise: Option<Uuid>,
    pub sync: SyncState,
}

impl SessionRecord {
    pub fn new(user_id: String, plan_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            plan_id,
            started_at,
            ended_at: None,
            exercise_index: 0,
            active: true,
            current_exercise: None,
            sync: SyncState::dirty(),
        }
    }
}

impl Syncable for SessionRecord {
    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn collection(&self) -> &'static str {
        "sessions"
    }

    fn needs_sync(&self) -> bool {
        self.sync.needs_sync
    }

    fn mark_dirty(&mut self) {
        self.sync.mark_dirty();
    }

    fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.sync.mark_synced(at);
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.sync.last_synced_at
    }

    fn sync_generation(&self) -> u64 {
        self.sync.generation
    }
}

/// One movement within an in-progress session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Name of the exercise template being performed.
    pub template_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Index of the current set within this exercise.
    pub set_index: usize,
    pub active: bool,
    pub current_set: Option<Uuid>,
    pub sync: SyncState,
}

impl ExerciseRecord {
    pub fn new(session_id: Uuid, template_name: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            template_name,
            started_at,
            ended_at: None,
            set_index: 0,
            active: true,
            current_set: None,
            sync: SyncState::dirty(),
        }
    }
}

impl Syncable for ExerciseRecord {
    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn collection(&self) -> &'static str {
        "exercises"
    }

    fn needs_sync(&self) -> bool {
        self.sync.needs_sync
    }

    fn mark_dirty(&mut self) {
        self.sync.mark_dirty();
    }

    fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.sync.mark_synced(at);
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.sync.last_synced_at
    }

    fn sync_generation(&self) -> u64 {
        self.sync.generation
    }
}

/// One repetition group within an exercise.
///
/// `ended_at`, once set, is never cleared: a set with no end time is "open"
/// and the state machine keeps at most one set open per exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRecord {
    pub id: Uuid,
    pub exercise_id: Uuid,
    /// Order within the exercise, starting at zero.
    pub order: u32,
    pub target_reps: u32,
    /// Filled in when the set is closed.
    pub actual_reps: Option<u32>,
    pub weight_kg: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Rest taken after completing this set, in seconds.
    pub rest_secs: Option<f64>,
    /// Opaque encoded sensor payload; appended chunk by chunk.
    pub sensor_payload: Vec<u8>,
    /// Chunk sequence numbers already merged, for duplicate suppression.
    pub applied_chunks: BTreeSet<u64>,
    pub heart_rate_bpm: Option<f64>,
    pub calories_kcal: Option<f64>,
    pub sync: SyncState,
}

impl SetRecord {
    pub fn new(
        exercise_id: Uuid,
        order: u32,
        target_reps: u32,
        weight_kg: f64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            exercise_id,
            order,
            target_reps,
            actual_reps: None,
            weight_kg,
            started_at,
            ended_at: None,
            rest_secs: None,
            sensor_payload: Vec::new(),
            applied_chunks: BTreeSet::new(),
            heart_rate_bpm: None,
            calories_kcal: None,
            sync: SyncState::dirty(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

impl Syncable for SetRecord {
    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn collection(&self) -> &'static str {
        "sets"
    }

    fn needs_sync(&self) -> bool {
        self.sync.needs_sync
    }

    fn mark_dirty(&mut self) {
        self.sync.mark_dirty();
    }

    fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.sync.mark_synced(at);
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.sync.last_synced_at
    }

    fn sync_generation(&self) -> u64 {
        self.sync.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_set_is_open_and_dirty() {
        let set = SetRecord::new(Uuid::new_v4(), 0, 10, 20.0, Utc::now());

        assert!(set.is_open());
        assert!(set.needs_sync());
        assert!(set.actual_reps.is_none());
        assert!(set.sensor_payload.is_empty());
    }

    #[test]
    fn test_session_collection_names() {
        let session = SessionRecord::new("user-1".to_string(), Uuid::new_v4(), Utc::now());
        let exercise = ExerciseRecord::new(session.id, "Squat".to_string(), Utc::now());
        let set = SetRecord::new(exercise.id, 0, 5, 100.0, Utc::now());

        assert_eq!(session.collection(), "sessions");
        assert_eq!(exercise.collection(), "exercises");
        assert_eq!(set.collection(), "sets");
    }
}
