//! In-memory queue and snapshot store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{
    encode_record, now_millis, DocumentSnapshot, QueueStore, QueuedUpdate, SnapshotStore, StoreError,
};
use crate::document::DocumentId;

/// Volatile store for tests and hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<DocumentId, VecDeque<QueuedUpdate>>>,
    snapshots: Mutex<HashMap<DocumentId, DocumentSnapshot>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total queued entries across all documents.
    pub fn total_queued(&self) -> usize {
        lock(&self.queues).values().map(VecDeque::len).sum()
    }
}

impl QueueStore for MemoryStore {
    fn append(&self, doc_id: DocumentId, payload: &[u8]) -> Result<QueuedUpdate, StoreError> {
        let entry = QueuedUpdate {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            doc_id,
            payload: payload.to_vec(),
            created_at: now_millis(),
            retry_count: 0,
        };
        lock(&self.queues)
            .entry(doc_id)
            .or_default()
            .push_back(entry.clone());
        Ok(entry)
    }

    fn read_all(&self, doc_id: DocumentId) -> Result<Vec<QueuedUpdate>, StoreError> {
        Ok(lock(&self.queues)
            .get(&doc_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, doc_id: DocumentId, id: u64) -> Result<(), StoreError> {
        if let Some(queue) = lock(&self.queues).get_mut(&doc_id) {
            queue.retain(|e| e.id != id);
        }
        Ok(())
    }

    fn delete_all(&self, doc_id: DocumentId) -> Result<usize, StoreError> {
        Ok(lock(&self.queues).remove(&doc_id).map_or(0, |q| q.len()))
    }

    fn increment_retry(&self, doc_id: DocumentId, id: u64) -> Result<u32, StoreError> {
        let mut queues = lock(&self.queues);
        let entry = queues
            .get_mut(&doc_id)
            .and_then(|q| q.iter_mut().find(|e| e.id == id))
            .ok_or(StoreError::NotFound { doc_id, id })?;
        entry.retry_count += 1;
        Ok(entry.retry_count)
    }

    fn purge_exhausted(
        &self,
        doc_id: DocumentId,
        max_retries: u32,
    ) -> Result<Vec<QueuedUpdate>, StoreError> {
        let mut queues = lock(&self.queues);
        let Some(queue) = queues.get_mut(&doc_id) else {
            return Ok(Vec::new());
        };
        let (purged, kept): (Vec<_>, Vec<_>) = queue
            .drain(..)
            .partition(|e| e.retry_count > max_retries);
        queue.extend(kept);
        Ok(purged)
    }

    fn len(&self, doc_id: DocumentId) -> Result<usize, StoreError> {
        Ok(lock(&self.queues).get(&doc_id).map_or(0, VecDeque::len))
    }
}

impl SnapshotStore for MemoryStore {
    fn get(&self, doc_id: DocumentId) -> Result<Option<DocumentSnapshot>, StoreError> {
        Ok(lock(&self.snapshots).get(&doc_id).cloned())
    }

    fn get_raw(&self, doc_id: DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        lock(&self.snapshots)
            .get(&doc_id)
            .map(encode_record)
            .transpose()
    }

    fn upsert(&self, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        lock(&self.snapshots).insert(snapshot.doc_id, snapshot.clone());
        Ok(())
    }

    fn delete(&self, doc_id: DocumentId) -> Result<(), StoreError> {
        lock(&self.snapshots).remove(&doc_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MAX_QUEUE_RETRIES;

    const DOC: DocumentId = DocumentId(1);
    const OTHER: DocumentId = DocumentId(2);

    #[test]
    fn test_queue_preserves_creation_order() {
        let store = MemoryStore::new();
        store.append(DOC, b"e1").unwrap();
        store.append(DOC, b"e2").unwrap();
        store.append(DOC, b"e3").unwrap();

        let payloads: Vec<_> = store
            .read_all(DOC)
            .unwrap()
            .into_iter()
            .map(|e| e.payload)
            .collect();
        assert_eq!(payloads, vec![b"e1".to_vec(), b"e2".to_vec(), b"e3".to_vec()]);
    }

    #[test]
    fn test_queue_isolated_per_document() {
        let store = MemoryStore::new();
        store.append(DOC, b"a").unwrap();
        store.append(OTHER, b"b").unwrap();

        assert_eq!(QueueStore::len(&store, DOC).unwrap(), 1);
        assert_eq!(store.delete_all(DOC).unwrap(), 1);
        assert_eq!(QueueStore::len(&store, DOC).unwrap(), 0);
        assert_eq!(QueueStore::len(&store, OTHER).unwrap(), 1);
        assert_eq!(store.total_queued(), 1);
    }

    #[test]
    fn test_delete_one() {
        let store = MemoryStore::new();
        let first = store.append(DOC, b"a").unwrap();
        store.append(DOC, b"b").unwrap();
        QueueStore::delete(&store, DOC, first.id).unwrap();

        let remaining = store.read_all(DOC).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, b"b");
    }

    #[test]
    fn test_retry_and_purge() {
        let store = MemoryStore::new();
        let doomed = store.append(DOC, b"doomed").unwrap();
        store.append(DOC, b"fine").unwrap();

        for _ in 0..=MAX_QUEUE_RETRIES {
            store.increment_retry(DOC, doomed.id).unwrap();
        }
        let purged = store.purge_exhausted(DOC, MAX_QUEUE_RETRIES).unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].payload, b"doomed");
        assert_eq!(store.read_all(DOC).unwrap()[0].payload, b"fine");
    }

    #[test]
    fn test_increment_missing_entry() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.increment_retry(DOC, 99),
            Err(StoreError::NotFound { id: 99, .. })
        ));
    }

    #[test]
    fn test_snapshot_upsert_replaces() {
        let store = MemoryStore::new();
        assert!(store.get(DOC).unwrap().is_none());

        store
            .upsert(&DocumentSnapshot::new(DOC, vec![0], vec![1]))
            .unwrap();
        store
            .upsert(&DocumentSnapshot::new(DOC, vec![0], vec![2]))
            .unwrap();
        assert_eq!(store.get(DOC).unwrap().unwrap().document_state, vec![2]);

        let raw = store.get_raw(DOC).unwrap().unwrap();
        let decoded: DocumentSnapshot = crate::storage::decode_record(&raw).unwrap();
        assert_eq!(decoded.document_state, vec![2]);

        SnapshotStore::delete(&store, DOC).unwrap();
        assert!(store.get(DOC).unwrap().is_none());
    }
}
