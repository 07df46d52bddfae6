// Session state machine module

pub mod error;
pub mod machine;

pub use error::{SessionError, SessionResult};
pub use machine::{
    ChunkDisposition, ContextSnapshot, Entitlements, FixedSetCap, SessionStateMachine,
    SessionTree, Unrestricted,
};
