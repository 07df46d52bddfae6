// Workout plans
//
// Plans are authored elsewhere (plan CRUD is an external collaborator); the
// core only reads them to drive exercise progression and ships them to the
// wearable over the device transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{SyncState, Syncable};

/// An ordered list of planned exercises executed during one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutPlan {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub exercises: Vec<PlanExercise>,
    pub sync: SyncState,
}

impl WorkoutPlan {
    pub fn new(user_id: String, name: String, exercises: Vec<PlanExercise>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name,
            exercises,
            sync: SyncState::dirty(),
        }
    }

    /// The planned exercise at `index`, if the plan has one left there.
    pub fn exercise_at(&self, index: usize) -> Option<&PlanExercise> {
        self.exercises.get(index)
    }
}

impl Syncable for WorkoutPlan {
    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn collection(&self) -> &'static str {
        "workout_plans"
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

/// One planned movement: which template, and the prescribed volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExercise {
    pub template_name: String,
    pub target_sets: u32,
    pub target_reps: u32,
    pub weight_kg: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exercise_at_bounds() {
        let plan = WorkoutPlan::new(
            "user-1".to_string(),
            "Push Day".to_string(),
            vec![PlanExercise {
                template_name: "Bench Press".to_string(),
                target_sets: 3,
                target_reps: 8,
                weight_kg: 60.0,
            }],
        );

        assert!(plan.exercise_at(0).is_some());
        assert!(plan.exercise_at(1).is_none());
    }
}
