// Remote document store contract
//
// The cloud side of synchronization, reduced to keyed document writes with
// server-assigned update timestamps. Collections are flat; per-user scoping
// is the store implementation's concern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::{SyncError, SyncResult};

/// Acknowledgment of a confirmed remote write. The server-assigned
/// timestamp becomes the entity's `last_synced_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAck {
    pub server_updated_at: DateTime<Utc>,
}

/// A document fetched from the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCopy {
    pub body: Value,
    pub server_updated_at: DateTime<Utc>,
}

/// Keyed document operations against the cloud store. Writes are
/// merge-on-write by key, so repeating an upload is harmless.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload(&self, collection: &str, key: Uuid, body: Value) -> SyncResult<RemoteAck>;

    async fn download(&self, collection: &str, key: Uuid) -> SyncResult<Option<RemoteCopy>>;

    /// Tombstone a document by identifier; deleting an absent document
    /// succeeds.
    async fn delete(&self, collection: &str, key: Uuid) -> SyncResult<RemoteAck>;
}

/// In-memory remote store with call counters and failure injection.
pub struct MockRemoteStore {
    documents: Mutex<HashMap<(String, Uuid), RemoteCopy>>,
    upload_calls: AtomicUsize,
    download_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    fail_next: AtomicUsize,
}

impl MockRemoteStore {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            upload_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` operations fail with `RemoteUnavailable`.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn upload_count(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.upload_count() + self.download_count() + self.delete_count()
    }

    pub async fn document(&self, collection: &str, key: Uuid) -> Option<RemoteCopy> {
        self.documents
            .lock()
            .await
            .get(&(collection.to_string(), key))
            .cloned()
    }

    /// Seed a document directly, bypassing upload accounting.
    pub async fn seed(&self, collection: &str, key: Uuid, body: Value, at: DateTime<Utc>) {
        self.documents.lock().await.insert(
            (collection.to_string(), key),
            RemoteCopy {
                body,
                server_updated_at: at,
            },
        );
    }

    fn take_failure(&self) -> bool {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

impl Default for MockRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MockRemoteStore {
    async fn upload(&self, collection: &str, key: Uuid, body: Value) -> SyncResult<RemoteAck> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(SyncError::RemoteUnavailable("injected failure".to_string()));
        }
        let at = Utc::now();
        self.documents.lock().await.insert(
            (collection.to_string(), key),
            RemoteCopy {
                body,
                server_updated_at: at,
            },
        );
        Ok(RemoteAck {
            server_updated_at: at,
        })
    }

    async fn download(&self, collection: &str, key: Uuid) -> SyncResult<Option<RemoteCopy>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(SyncError::RemoteUnavailable("injected failure".to_string()));
        }
        Ok(self
            .documents
            .lock()
            .await
            .get(&(collection.to_string(), key))
            .cloned())
    }

    async fn delete(&self, collection: &str, key: Uuid) -> SyncResult<RemoteAck> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(SyncError::RemoteUnavailable("injected failure".to_string()));
        }
        self.documents
            .lock()
            .await
            .remove(&(collection.to_string(), key));
        Ok(RemoteAck {
            server_updated_at: Utc::now(),
        })
    }
}
