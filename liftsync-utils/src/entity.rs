// Syncable entity capability
//
// Every record that is reconciled against the remote document store carries
// a dirty flag and the timestamp of its last confirmed remote write. The
// cloud sync engine only ever talks to entities through this trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Capability implemented by every persisted record that participates in
/// cloud synchronization.
///
/// The dirty flag is cleared exclusively via [`Syncable::mark_synced`],
/// which the sync engine calls only after a confirmed remote acknowledgment.
pub trait Syncable {
    /// Stable identifier; doubles as the remote document key.
    fn entity_id(&self) -> Uuid;

    /// Remote collection this entity belongs to (e.g. "workout_history").
    fn collection(&self) -> &'static str;

    /// Whether the local copy has changes the remote has not seen.
    fn needs_sync(&self) -> bool;

    /// Flag the entity as having unsynced local changes. Every call
    /// advances the dirty generation, so an in-flight ack snapshotted
    /// before the change can be told apart from the current state.
    fn mark_dirty(&mut self);

    /// Record a confirmed remote write. `at` is the server-assigned
    /// update timestamp from the acknowledgment.
    fn mark_synced(&mut self, at: DateTime<Utc>);

    /// Timestamp of the last confirmed remote write, if any.
    fn last_synced_at(&self) -> Option<DateTime<Utc>>;

    /// Monotonic counter of local mutations. An upload snapshots this;
    /// the ack only clears the dirty flag while the value is unchanged.
    fn sync_generation(&self) -> u64;
}

/// Embeddable sync bookkeeping shared by all entity records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub needs_sync: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Bumped on every `mark_dirty`; remote acks carry the value they
    /// were snapshotted at and are ignored once it has moved on.
    #[serde(default)]
    pub generation: u64,
}

impl SyncState {
    /// Freshly created entities start dirty: they exist locally and the
    /// remote has never seen them.
    pub fn dirty() -> Self {
        Self {
            needs_sync: true,
            last_synced_at: None,
            generation: 0,
        }
    }

    /// State for an entity known to match the remote copy.
    pub fn clean(at: DateTime<Utc>) -> Self {
        Self {
            needs_sync: false,
            last_synced_at: Some(at),
            generation: 0,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.needs_sync = true;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Clear the dirty flag unconditionally. Callers reconciling against
    /// a snapshot go through [`SyncState::mark_synced_at_generation`].
    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.needs_sync = false;
        self.last_synced_at = Some(at);
    }

    /// Record a confirmed remote write for the state as it was at
    /// `generation`. A mutation since that snapshot keeps the flag dirty,
    /// only the server timestamp is taken. Returns whether the flag was
    /// cleared.
    pub fn mark_synced_at_generation(&mut self, at: DateTime<Utc>, generation: u64) -> bool {
        self.last_synced_at = Some(at);
        if self.generation == generation {
            self.needs_sync = false;
            true
        } else {
            false
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_dirty() {
        let state = SyncState::dirty();
        assert!(state.needs_sync);
        assert!(state.last_synced_at.is_none());
    }

    #[test]
    fn test_mark_synced_clears_flag_and_records_timestamp() {
        let mut state = SyncState::dirty();
        let now = Utc::now();

        state.mark_synced(now);

        assert!(!state.needs_sync);
        assert_eq!(state.last_synced_at, Some(now));
    }

    #[test]
    fn test_redirty_keeps_last_synced_at() {
        let mut state = SyncState::dirty();
        let now = Utc::now();

        state.mark_synced(now);
        state.mark_dirty();

        assert!(state.needs_sync);
        assert_eq!(state.last_synced_at, Some(now));
    }

    #[test]
    fn test_every_dirty_mark_advances_generation() {
        let mut state = SyncState::dirty();
        assert_eq!(state.generation, 0);

        state.mark_dirty();
        state.mark_dirty();

        assert_eq!(state.generation, 2);
    }

    #[test]
    fn test_generation_matched_ack_clears_flag() {
        let mut state = SyncState::dirty();
        let snapshot = state.generation;

        assert!(state.mark_synced_at_generation(Utc::now(), snapshot));
        assert!(!state.needs_sync);
    }

    #[test]
    fn test_stale_generation_ack_keeps_flag_dirty() {
        let mut state = SyncState::dirty();
        let snapshot = state.generation;
        let now = Utc::now();

        state.mark_dirty();

        assert!(!state.mark_synced_at_generation(now, snapshot));
        assert!(state.needs_sync);
        assert_eq!(state.last_synced_at, Some(now));
    }
}
