// LiftSync data model
//
// In-progress session records, their immutable history mirror, and the
// workout-plan types both devices exchange.

mod history;
mod plan;
mod session;

pub use history::{HistoryExercise, HistorySet, WorkoutHistory};
pub use plan::{PlanExercise, WorkoutPlan};
pub use session::{ExerciseRecord, SessionRecord, SetRecord};
