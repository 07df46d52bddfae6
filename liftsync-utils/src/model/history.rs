// Workout history records
//
// The immutable post-session mirror of the in-progress hierarchy. Created
// exactly once by the history migrator, never mutated afterwards, only
// synced. There are no "current" pointers here and no open/active flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{SyncState, Syncable};

/// One finished workout, as durable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutHistory {
    pub id: Uuid,
    pub user_id: String,
    pub plan_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub exercises: Vec<HistoryExercise>,
    pub sync: SyncState,
}

impl WorkoutHistory {
    pub fn set_count(&self) -> usize {
        self.exercises.iter().map(|e| e.sets.len()).sum()
    }
}

impl Syncable for WorkoutHistory {
    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn collection(&self) -> &'static str {
        "workout_history"
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

/// All sets performed under one exercise template name.
///
/// Sets from in-progress exercises that shared a template name are merged
/// into a single history exercise, preserving set order as encountered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryExercise {
    pub id: Uuid,
    pub template_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub sets: Vec<HistorySet>,
}

/// One completed set, scalar fields copied from the source set and the
/// raw encoded sensor payload preserved byte for byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySet {
    pub id: Uuid,
    pub order: u32,
    pub target_reps: u32,
    pub actual_reps: Option<u32>,
    pub weight_kg: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub rest_secs: Option<f64>,
    pub heart_rate_bpm: Option<f64>,
    pub calories_kcal: Option<f64>,
    /// Verbatim copy of the source set's encoded payload. Never
    /// reinterpreted during migration.
    pub sensor_payload: Vec<u8>,
}
