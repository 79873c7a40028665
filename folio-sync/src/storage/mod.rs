//! Persistence for offline edits and document snapshots.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  append / drain   ┌──────────────────────────────┐
//! │ SyncOrchestrator │ ────────────────► │ QueueStore    (FIFO per doc) │
//! │                  │  upsert / get     │ SnapshotStore (1 per doc)    │
//! └──────────────────┘ ────────────────► └──────────────┬───────────────┘
//!                                                       │
//!                                        ┌──────────────┴──────────────┐
//!                                        ▼                             ▼
//!                                 MemoryStore                   RocksStore
//!                                 (tests, ephemeral)            (column families
//!                                                                "snapshots", "queue")
//! ```
//!
//! Both stores may be shared by many sessions. Every operation is scoped by
//! [`DocumentId`]; writes for one document are applied in call order.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::document::DocumentId;

/// Entries whose retry counter exceeds this are purged.
pub const MAX_QUEUE_RETRIES: u32 = 5;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A local update waiting for a synced connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedUpdate {
    /// Store-assigned id, increasing in creation order
    pub id: u64,
    pub doc_id: DocumentId,
    /// Raw update payload (not yet framed)
    pub payload: Vec<u8>,
    /// Creation time (ms since epoch)
    pub created_at: u64,
    pub retry_count: u32,
}

/// Persisted document state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub doc_id: DocumentId,
    /// Encoded state vector
    pub state_vector: Vec<u8>,
    /// Full `DocumentState::export_state` output
    pub document_state: Vec<u8>,
    /// Last write (ms since epoch)
    pub updated_at: u64,
}

impl DocumentSnapshot {
    pub fn new(doc_id: DocumentId, state_vector: Vec<u8>, document_state: Vec<u8>) -> Self {
        Self {
            doc_id,
            state_vector,
            document_state,
            updated_at: now_millis(),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue entry {id} not found for {doc_id}")]
    NotFound { doc_id: DocumentId, id: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

/// Durable FIFO of queued updates, keyed by document.
pub trait QueueStore: Send + Sync {
    /// Append a new entry; returns the stored record.
    fn append(&self, doc_id: DocumentId, payload: &[u8]) -> Result<QueuedUpdate, StoreError>;

    /// All entries for `doc_id` in creation order.
    fn read_all(&self, doc_id: DocumentId) -> Result<Vec<QueuedUpdate>, StoreError>;

    /// Remove one entry. Removing an absent entry is not an error.
    fn delete(&self, doc_id: DocumentId, id: u64) -> Result<(), StoreError>;

    /// Remove every entry for `doc_id`; returns how many were removed.
    fn delete_all(&self, doc_id: DocumentId) -> Result<usize, StoreError>;

    /// Bump an entry's retry counter; returns the new value.
    fn increment_retry(&self, doc_id: DocumentId, id: u64) -> Result<u32, StoreError>;

    /// Drop entries whose retry counter exceeds `max_retries`; returns them.
    fn purge_exhausted(
        &self,
        doc_id: DocumentId,
        max_retries: u32,
    ) -> Result<Vec<QueuedUpdate>, StoreError>;

    /// Number of entries for `doc_id`.
    fn len(&self, doc_id: DocumentId) -> Result<usize, StoreError> {
        Ok(self.read_all(doc_id)?.len())
    }
}

/// One snapshot per document.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, doc_id: DocumentId) -> Result<Option<DocumentSnapshot>, StoreError>;

    /// The stored record exactly as persisted, without decoding. Still
    /// readable when `get` fails on a damaged record.
    fn get_raw(&self, doc_id: DocumentId) -> Result<Option<Vec<u8>>, StoreError>;

    fn upsert(&self, snapshot: &DocumentSnapshot) -> Result<(), StoreError>;

    fn delete(&self, doc_id: DocumentId) -> Result<(), StoreError>;
}

pub(crate) fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}
