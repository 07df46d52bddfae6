// History migrator
//
// One-time conversion of an ended session's hierarchy into immutable
// workout history. The migrated tree is committed to the store in a single
// put; if that put fails nothing is persisted and the caller's in-progress
// hierarchy remains intact for retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use liftsync_utils::entity::{SyncState, Syncable};
use liftsync_utils::model::{HistoryExercise, HistorySet, WorkoutHistory};

use crate::session::SessionTree;

/// Errors that can occur migrating a session to history
#[derive(Debug)]
pub enum HistoryError {
    /// The source session has no end time; only finalized trees migrate
    SourceNotFinalized,
    /// The history store rejected the write
    Store(String),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceNotFinalized => write!(f, "source session is not finalized"),
            Self::Store(msg) => write!(f, "history store error: {}", msg),
        }
    }
}

impl std::error::Error for HistoryError {}

/// Result type for history operations
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Durable storage for workout history documents.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist a history document, replacing any existing one with the
    /// same id. Must be all-or-nothing.
    async fn put(&self, history: WorkoutHistory) -> HistoryResult<()>;

    async fn get(&self, id: Uuid) -> HistoryResult<Option<WorkoutHistory>>;

    /// All documents whose local copy the remote has not confirmed.
    async fn dirty(&self) -> HistoryResult<Vec<WorkoutHistory>>;

    /// Record a confirmed remote write for a stored document. `generation`
    /// is the document's dirty generation at upload time; a document
    /// replaced since then stays dirty.
    async fn confirm_synced(&self, id: Uuid, at: DateTime<Utc>, generation: u64)
        -> HistoryResult<()>;
}

/// History store backed by a map. Tests and single-process deployments;
/// failure injection covers the migration-atomicity paths.
pub struct InMemoryHistoryStore {
    entries: Mutex<HashMap<Uuid, WorkoutHistory>>,
    put_calls: AtomicUsize,
    fail_next_puts: AtomicUsize,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            put_calls: AtomicUsize::new(0),
            fail_next_puts: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` puts fail.
    pub fn fail_next_puts(&self, n: usize) {
        self.fail_next_puts.store(n, Ordering::SeqCst);
    }

    pub fn put_count(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn put(&self, history: WorkoutHistory) -> HistoryResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_next_puts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_puts.store(remaining - 1, Ordering::SeqCst);
            return Err(HistoryError::Store("injected put failure".to_string()));
        }
        self.entries.lock().await.insert(history.id, history);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> HistoryResult<Option<WorkoutHistory>> {
        Ok(self.entries.lock().await.get(&id).cloned())
    }

    async fn dirty(&self) -> HistoryResult<Vec<WorkoutHistory>> {
        Ok(self
            .entries
            .lock()
            .await
            .values()
            .filter(|h| h.needs_sync())
            .cloned()
            .collect())
    }

    async fn confirm_synced(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        generation: u64,
    ) -> HistoryResult<()> {
        if let Some(history) = self.entries.lock().await.get_mut(&id) {
            history.sync.mark_synced_at_generation(at, generation);
        }
        Ok(())
    }
}

/// Converts finalized session trees into history documents and commits
/// them to the store.
pub struct HistoryMigrator {
    store: Arc<dyn HistoryStore>,
}

impl HistoryMigrator {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Migrate a finalized tree. Commits in one store put; on failure
    /// nothing is persisted and the call can simply be repeated. The
    /// history document reuses the session's id, so a retry overwrites
    /// rather than duplicates.
    pub async fn migrate(&self, tree: &SessionTree) -> HistoryResult<WorkoutHistory> {
        let history = build_history(tree)?;
        self.store.put(history.clone()).await?;
        info!(
            "session {} migrated: {} exercises, {} sets",
            history.id,
            history.exercises.len(),
            history.set_count()
        );
        Ok(history)
    }
}

/// Build the immutable history tree from a finalized session.
///
/// Sets are grouped by their exercise's template name: exercises that
/// shared a name collapse into one history exercise, set order preserved
/// as encountered. Sensor payloads are copied verbatim, never decoded.
pub fn build_history(tree: &SessionTree) -> HistoryResult<WorkoutHistory> {
    let session_end = tree
        .session
        .ended_at
        .ok_or(HistoryError::SourceNotFinalized)?;

    let mut by_name: HashMap<&str, usize> = HashMap::new();
    let mut exercises: Vec<HistoryExercise> = Vec::new();

    for (exercise, sets) in &tree.exercises {
        let ended = exercise.ended_at.unwrap_or(session_end);
        let index = match by_name.get(exercise.template_name.as_str()) {
            Some(&index) => {
                let merged = &mut exercises[index];
                debug!(
                    "merging exercise {} into existing {}",
                    exercise.id, merged.template_name
                );
                merged.started_at = merged.started_at.min(exercise.started_at);
                merged.ended_at = merged.ended_at.max(ended);
                index
            }
            None => {
                exercises.push(HistoryExercise {
                    id: Uuid::new_v4(),
                    template_name: exercise.template_name.clone(),
                    started_at: exercise.started_at,
                    ended_at: ended,
                    sets: Vec::new(),
                });
                by_name.insert(exercise.template_name.as_str(), exercises.len() - 1);
                exercises.len() - 1
            }
        };

        for set in sets {
            exercises[index].sets.push(HistorySet {
                id: set.id,
                order: set.order,
                target_reps: set.target_reps,
                actual_reps: set.actual_reps,
                weight_kg: set.weight_kg,
                started_at: set.started_at,
                ended_at: set.ended_at.unwrap_or(session_end),
                rest_secs: set.rest_secs,
                heart_rate_bpm: set.heart_rate_bpm,
                calories_kcal: set.calories_kcal,
                sensor_payload: set.sensor_payload.clone(),
            });
        }
    }

    Ok(WorkoutHistory {
        id: tree.session.id,
        user_id: tree.session.user_id.clone(),
        plan_id: tree.session.plan_id,
        started_at: tree.session.started_at,
        ended_at: session_end,
        exercises,
        sync: SyncState::dirty(),
    })
}
