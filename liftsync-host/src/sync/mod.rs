// Cloud synchronization module

pub mod engine;
pub mod error;
pub mod remote;

pub use engine::{
    SchedulerHandle, SyncConfig, SyncEngine, SyncJob, SyncNotice, SyncOutcome, SyncPassSummary,
    SyncReport, SyncRoster, SyncStrategy,
};
pub use error::{SyncError, SyncResult};
pub use remote::{MockRemoteStore, RemoteAck, RemoteCopy, RemoteStore};
