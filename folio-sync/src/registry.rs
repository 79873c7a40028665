//! Open sessions keyed by document.
//!
//! The host owns a [`SessionRegistry`]; there is no process-wide instance.
//! Sessions share the registry's stores and credentials.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::SyncConfig;
use crate::document::DocumentId;
use crate::orchestrator::{SyncError, SyncOrchestrator};
use crate::storage::{QueueStore, SnapshotStore};
use crate::transport::CredentialProvider;

/// Map of open [`SyncOrchestrator`]s.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<DocumentId, Arc<SyncOrchestrator>>>,
    config: SyncConfig,
    credentials: Arc<dyn CredentialProvider>,
    queue: Arc<dyn QueueStore>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl SessionRegistry {
    pub fn new(
        config: SyncConfig,
        credentials: Arc<dyn CredentialProvider>,
        queue: Arc<dyn QueueStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            credentials,
            queue,
            snapshots,
        }
    }

    /// Get the session for `doc_id`, creating and initializing it with
    /// `seed` if none is open.
    pub async fn open(
        &self,
        doc_id: DocumentId,
        seed: &str,
    ) -> Result<Arc<SyncOrchestrator>, SyncError> {
        // Fast path: read lock
        if let Some(session) = self.get(doc_id).await {
            return Ok(session);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&doc_id) {
            return Ok(Arc::clone(session));
        }

        let session = Arc::new(SyncOrchestrator::new(
            doc_id,
            self.config.clone(),
            Arc::clone(&self.credentials),
            Arc::clone(&self.queue),
            Arc::clone(&self.snapshots),
        ));
        session.initialize(seed).await?;
        sessions.insert(doc_id, Arc::clone(&session));
        log::info!("Opened session for {doc_id} ({} open)", sessions.len());
        Ok(session)
    }

    pub async fn get(&self, doc_id: DocumentId) -> Option<Arc<SyncOrchestrator>> {
        self.sessions.read().await.get(&doc_id).cloned()
    }

    /// Destroy and forget the session for `doc_id`.
    pub async fn close(&self, doc_id: DocumentId) -> bool {
        let removed = self.sessions.write().await.remove(&doc_id);
        match removed {
            Some(session) => {
                session.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Destroy every session.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, session) in &drained {
            session.destroy().await;
        }
        drained.len()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.sessions.read().await.keys().copied().collect()
    }
}
