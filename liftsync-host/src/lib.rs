// LiftSync host library
//
// Runs on the paired host device: the session state machine owning the
// in-progress hierarchy, the migrator that turns finished sessions into
// durable history, the cloud sync engine, and the service facade routing
// device messages into all of them.

pub mod history;
pub mod service;
pub mod session;
pub mod sync;

pub use history::{HistoryMigrator, HistoryStore, InMemoryHistoryStore};
pub use service::HostService;
pub use session::{
    ChunkDisposition, Entitlements, FixedSetCap, SessionError, SessionResult,
    SessionStateMachine, SessionTree, Unrestricted,
};
pub use sync::{
    MockRemoteStore, RemoteStore, SyncConfig, SyncEngine, SyncNotice, SyncOutcome, SyncStrategy,
};
