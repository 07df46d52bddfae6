// Session state machine errors
//
// Invariant violations are usage errors: surfaced to the caller, never
// retried. Stale or mismatched sensor chunks are not errors at all and
// never appear here.

use std::fmt;

use liftsync_utils::codec::CodecError;

/// Errors that can occur mutating the in-progress session hierarchy
#[derive(Debug)]
pub enum SessionError {
    /// A session is already active for this user
    SessionAlreadyActive { user_id: String },
    /// The operation requires an active session and there is none
    SessionNotActive,
    /// The operation requires an active exercise and there is none
    NoActiveExercise,
    /// The operation requires an open set and there is none
    NoOpenSet,
    /// The plan has no exercises left to start
    PlanExhausted { plan: String },
    /// No plan with this id is registered with the host
    UnknownPlan { plan_id: String },
    /// Set order must be non-negative
    InvalidSetOrder { order: i64 },
    /// Target repetitions must be positive
    InvalidTargetReps { target_reps: i64 },
    /// Weight must be finite and non-negative
    InvalidWeight { weight_kg: f64 },
    /// The entitlement tier caps sets per exercise
    SetLimitExceeded { limit: u32 },
    /// A stored sensor payload failed to decode or extend
    Codec(CodecError),
    /// History migration did not commit; the hierarchy is untouched
    MigrationFailed(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionAlreadyActive { user_id } => {
                write!(f, "user {} already has an active session", user_id)
            }
            Self::SessionNotActive => write!(f, "no active session"),
            Self::NoActiveExercise => write!(f, "no active exercise"),
            Self::NoOpenSet => write!(f, "no open set"),
            Self::PlanExhausted { plan } => {
                write!(f, "plan {} has no remaining exercises", plan)
            }
            Self::UnknownPlan { plan_id } => write!(f, "unknown plan {}", plan_id),
            Self::InvalidSetOrder { order } => write!(f, "invalid set order {}", order),
            Self::InvalidTargetReps { target_reps } => {
                write!(f, "invalid target reps {}", target_reps)
            }
            Self::InvalidWeight { weight_kg } => write!(f, "invalid weight {}", weight_kg),
            Self::SetLimitExceeded { limit } => {
                write!(f, "set limit of {} per exercise exceeded", limit)
            }
            Self::Codec(e) => write!(f, "sensor payload error: {}", e),
            Self::MigrationFailed(msg) => write!(f, "history migration failed: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
