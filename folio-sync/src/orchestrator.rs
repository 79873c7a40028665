//! Per-document sync session.
//!
//! A [`SyncOrchestrator`] owns one [`DocumentState`] and one
//! [`TransportClient`], and talks to a shared [`QueueStore`] and
//! [`SnapshotStore`]:
//!
//! ```text
//! on_local_edit ──► DocumentState ──► Synced? ──yes──► TransportClient
//!                                        │no
//!                                        ▼
//!                                    QueueStore ──(after Step2)──► drain
//!
//! TransportClient ──events──► pump task ──► DocumentState ──► SnapshotStore
//!                                               └──► content watch / SyncEvent
//! ```
//!
//! Every mutation of the document and of this document's queue happens
//! while holding the document lock, so local edits, remote updates and queue
//! replay never interleave. Queue entries are sent in creation order and
//! deleted only after the transport accepted them.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::document::{ContentUpdate, DocumentId, DocumentState};
use crate::protocol::{encode_state_vector, SyncMessage};
use crate::state_vector::StateVector;
use crate::storage::{DocumentSnapshot, QueueStore, SnapshotStore, StoreError};
use crate::transport::{
    ConnectionState, CredentialProvider, TransportClient, TransportError, TransportEvent,
};
use crate::varint::CodecError;

/// Notifications for the host editor.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Remote content replaced the local snapshot
    ContentChanged(String),
    ConnectionChanged(ConnectionState),
    /// Opaque presence payload from another participant
    Presence(Vec<u8>),
    /// Server refused the credential; no automatic retry follows
    AuthRejected(Option<String>),
    /// Reconnection gave up; call `connect()` to retry
    ReconnectExhausted,
    /// Queue entries dropped after too many failed sends
    QueueEntriesDropped(usize),
    /// Stored snapshot could not be decoded. Carries the document state
    /// bytes, or the whole stored record when the record itself is damaged.
    SnapshotDiscarded(Vec<u8>),
}

/// What happened to a local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// Content identical to the current snapshot
    Unchanged,
    /// Handed to the live connection
    Sent,
    /// Stored in the offline queue
    Queued,
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Session {
    doc_id: DocumentId,
    doc: tokio::sync::Mutex<DocumentState>,
    transport: TransportClient,
    queue: Arc<dyn QueueStore>,
    snapshots: Arc<dyn SnapshotStore>,
    content_tx: watch::Sender<String>,
    event_tx: mpsc::Sender<SyncEvent>,
    max_queue_retries: u32,
}

impl Session {
    fn notify(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::debug!("{}: host event not delivered: {e}", self.doc_id);
        }
    }

    fn persist(&self, doc: &DocumentState) -> Result<(), StoreError> {
        let snapshot = DocumentSnapshot::new(
            self.doc_id,
            encode_state_vector(doc.state_vector()),
            doc.export_state(),
        );
        self.snapshots.upsert(&snapshot).inspect_err(|e| {
            log::error!("{}: failed to persist snapshot: {e}", self.doc_id);
        })
    }

    /// Replay queued updates. Caller holds the document lock.
    ///
    /// Stops at the first send the transport refuses; that entry's retry
    /// counter is bumped and it stays queued with everything after it.
    fn drain_locked(&self) -> Result<usize, SyncError> {
        let entries = self.queue.read_all(self.doc_id)?;
        if entries.is_empty() {
            return Ok(0);
        }
        log::info!(
            "{}: replaying {} queued updates",
            self.doc_id,
            entries.len()
        );

        let mut sent = 0;
        for entry in &entries {
            if !self.transport.send_update(&entry.payload) {
                let retries = self.queue.increment_retry(self.doc_id, entry.id)?;
                log::warn!(
                    "{}: replay stopped at entry {} (retry {retries})",
                    self.doc_id,
                    entry.id
                );
                break;
            }
            self.queue.delete(self.doc_id, entry.id)?;
            sent += 1;
        }

        let dropped = self
            .queue
            .purge_exhausted(self.doc_id, self.max_queue_retries)?;
        if !dropped.is_empty() {
            log::warn!(
                "{}: dropped {} queued updates after {} failed sends",
                self.doc_id,
                dropped.len(),
                self.max_queue_retries
            );
            self.notify(SyncEvent::QueueEntriesDropped(dropped.len()));
        }
        Ok(sent)
    }

    /// Send or queue a fresh local update. Caller holds the document lock.
    ///
    /// An error means the update went nowhere.
    fn route_edit(&self, update: &[u8]) -> Result<EditOutcome, SyncError> {
        if self.transport.state() != ConnectionState::Synced {
            self.queue.append(self.doc_id, update)?;
            return Ok(EditOutcome::Queued);
        }
        if self.queue.len(self.doc_id)? == 0 {
            if self.transport.send_update(update) {
                return Ok(EditOutcome::Sent);
            }
            self.queue.append(self.doc_id, update)?;
            return Ok(EditOutcome::Queued);
        }

        // Older edits are still queued; keep creation order.
        self.queue.append(self.doc_id, update)?;
        if let Err(e) = self.drain_locked() {
            log::error!("{}: queue replay failed: {e}", self.doc_id);
            return Ok(EditOutcome::Queued);
        }
        match self.queue.len(self.doc_id) {
            Ok(0) => Ok(EditOutcome::Sent),
            _ => Ok(EditOutcome::Queued),
        }
    }

    async fn drain(&self) -> Result<usize, SyncError> {
        let _doc = self.doc.lock().await;
        self.drain_locked()
    }

    async fn apply_remote(&self, update: &[u8]) {
        let mut doc = self.doc.lock().await;
        if !doc.apply_remote_update(update) {
            log::debug!("{}: empty remote update", self.doc_id);
            return;
        }
        // Queued local edits reach the server after this update and win
        // there, so the local content stays as it is until they drain.
        let pending = match self.queue.len(self.doc_id) {
            Ok(n) => n > 0,
            Err(e) => {
                log::warn!("{}: queue length unavailable: {e}", self.doc_id);
                true
            }
        };
        let changed = match ContentUpdate::decode(update) {
            Ok(content) if pending => {
                doc.observe_remote_clock(&content);
                false
            }
            Ok(content) => doc.adopt_remote_content(&content),
            Err(e) => {
                log::debug!("{}: remote update carries no content: {e}", self.doc_id);
                false
            }
        };
        let _ = self.persist(&doc);
        if changed {
            self.content_tx.send_replace(doc.content().to_owned());
            self.notify(SyncEvent::ContentChanged(doc.content().to_owned()));
        }
    }

    /// Server announced its state vector: catch up and answer with what it lacks.
    async fn answer_step1(&self, remote: &StateVector) {
        let mut doc = self.doc.lock().await;
        let reply = doc.encode_update_since(remote);
        doc.merge_state_vector(remote);
        let _ = self.persist(&doc);
        if let Some(update) = reply {
            if !self.transport.send_step2(&update) {
                log::debug!("{}: step 2 reply not sent", self.doc_id);
            }
        }
    }

    async fn handle_message(&self, message: SyncMessage) {
        match message {
            SyncMessage::Step2(update) => {
                self.apply_remote(&update).await;
                log::info!("{}: synced", self.doc_id);
                if let Err(e) = self.drain().await {
                    log::error!("{}: queue replay failed: {e}", self.doc_id);
                }
            }
            SyncMessage::Update(update) => self.apply_remote(&update).await,
            SyncMessage::Step1(remote) => self.answer_step1(&remote).await,
            SyncMessage::Presence(payload) => self.notify(SyncEvent::Presence(payload)),
            SyncMessage::Auth {
                success: false,
                message,
            } => self.notify(SyncEvent::AuthRejected(message)),
            SyncMessage::Auth { success: true, .. } | SyncMessage::Unknown(_) => {}
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                self.notify(SyncEvent::ConnectionChanged(state));
            }
            TransportEvent::Message(message) => self.handle_message(message).await,
            TransportEvent::ReconnectExhausted { attempts } => {
                log::warn!(
                    "{}: offline after {attempts} reconnect attempts",
                    self.doc_id
                );
                self.notify(SyncEvent::ReconnectExhausted);
            }
        }
    }
}

/// One editing session for one document.
pub struct SyncOrchestrator {
    session: Arc<Session>,
    transport_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    event_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
}

impl SyncOrchestrator {
    pub fn new(
        doc_id: DocumentId,
        config: SyncConfig,
        credentials: Arc<dyn CredentialProvider>,
        queue: Arc<dyn QueueStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        let mut transport = TransportClient::new(doc_id, config.transport, credentials);
        // A fresh client always hands out its receiver.
        let transport_rx = transport
            .take_event_rx()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);

        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (content_tx, _) = watch::channel(String::new());

        Self {
            session: Arc::new(Session {
                doc_id,
                doc: tokio::sync::Mutex::new(DocumentState::new()),
                transport,
                queue,
                snapshots,
                content_tx,
                event_tx,
                max_queue_retries: config.max_queue_retries,
            }),
            transport_rx: Arc::new(tokio::sync::Mutex::new(transport_rx)),
            pump: Mutex::new(None),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Load the persisted snapshot (or seed fresh content) and connect.
    ///
    /// An undecodable snapshot is replaced by `seed` and reported as
    /// [`SyncEvent::SnapshotDiscarded`].
    pub async fn initialize(&self, seed: &str) -> Result<(), SyncError> {
        let session = &self.session;
        {
            let mut doc = session.doc.lock().await;
            match session.snapshots.get(session.doc_id) {
                Ok(Some(snapshot)) => match doc.restore_state(&snapshot.document_state) {
                    Ok(()) => {
                        log::info!(
                            "{}: restored snapshot (clock {})",
                            session.doc_id,
                            doc.clock()
                        );
                    }
                    Err(e) => {
                        log::warn!(
                            "{}: discarding corrupted snapshot: {e}",
                            session.doc_id
                        );
                        doc.initialize_from_seed(seed);
                        session.notify(SyncEvent::SnapshotDiscarded(snapshot.document_state));
                    }
                },
                Ok(None) => doc.initialize_from_seed(seed),
                Err(e) => {
                    log::warn!(
                        "{}: snapshot unreadable, starting from seed: {e}",
                        session.doc_id
                    );
                    doc.initialize_from_seed(seed);
                    match session.snapshots.get_raw(session.doc_id) {
                        Ok(Some(raw)) => session.notify(SyncEvent::SnapshotDiscarded(raw)),
                        Ok(None) => {}
                        Err(e) => {
                            log::error!("{}: raw snapshot lost: {e}", session.doc_id);
                        }
                    }
                }
            }
            session.content_tx.send_replace(doc.content().to_owned());
        }
        self.connect()?;
        Ok(())
    }

    /// Apply a local edit: send it when synced, otherwise queue it.
    ///
    /// If the edit can be neither sent nor queued, the document is left as
    /// it was and the error is returned.
    pub async fn on_local_edit(&self, new_content: &str) -> Result<EditOutcome, SyncError> {
        let session = &self.session;
        let mut doc = session.doc.lock().await;
        let previous = doc.clone();
        let Some(update) = doc.set_local_content(new_content) else {
            return Ok(EditOutcome::Unchanged);
        };

        let outcome = match session.route_edit(&update) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("{}: local edit not stored: {e}", session.doc_id);
                *doc = previous;
                return Err(e);
            }
        };
        session.content_tx.send_replace(doc.content().to_owned());
        log::debug!("{}: local edit {:?} (clock {})", session.doc_id, outcome, doc.clock());

        session.persist(&doc)?;
        Ok(outcome)
    }

    /// Replay the offline queue now. Only useful while synced.
    pub async fn drain_queue(&self) -> Result<usize, SyncError> {
        self.session.drain().await
    }

    /// Start (or resume) the connection. `Ok(false)` if already active.
    pub fn connect(&self) -> Result<bool, SyncError> {
        let started = self.session.transport.connect()?;
        self.ensure_pump();
        Ok(started)
    }

    fn ensure_pump(&self) {
        let mut pump = lock(&self.pump);
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let session = Arc::clone(&self.session);
        let transport_rx = Arc::clone(&self.transport_rx);
        *pump = Some(tokio::spawn(async move {
            let mut events = transport_rx.lock().await;
            while let Some(event) = events.recv().await {
                session.handle_transport_event(event).await;
            }
        }));
    }

    async fn stop_pump(&self) {
        let pump = lock(&self.pump).take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }
        // Events from the retired connection are meaningless now.
        if let Ok(mut events) = self.transport_rx.try_lock() {
            while events.try_recv().is_ok() {}
        }
    }

    /// Close the connection and stop background work. Document state and the
    /// persisted snapshot are kept; `connect()` resumes.
    pub async fn disconnect(&self) {
        let was = self.session.transport.state();
        self.session.transport.disconnect();
        self.stop_pump().await;
        if was != ConnectionState::Disconnected {
            self.session
                .notify(SyncEvent::ConnectionChanged(ConnectionState::Disconnected));
        }
        log::info!("{}: disconnected", self.session.doc_id);
    }

    /// Like `disconnect`, and refuse further connections.
    pub async fn destroy(&self) {
        self.session.transport.destroy();
        self.stop_pump().await;
        log::info!("{}: session destroyed", self.session.doc_id);
    }

    /// Take the host event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        lock(&self.event_rx).take()
    }

    /// Latest known content.
    pub fn current_content(&self) -> String {
        self.session.content_tx.borrow().clone()
    }

    /// Watch content changes, local and remote.
    pub fn subscribe_content(&self) -> watch::Receiver<String> {
        self.session.content_tx.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.transport.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.transport.subscribe_state()
    }

    /// Send an opaque presence payload if connected.
    pub fn send_presence(&self, payload: &[u8]) -> bool {
        self.session.transport.send_presence(payload)
    }

    /// Entries waiting in the offline queue for this document.
    pub fn queued_updates(&self) -> Result<usize, SyncError> {
        Ok(self.session.queue.len(self.session.doc_id)?)
    }

    pub fn doc_id(&self) -> DocumentId {
        self.session.doc_id
    }

    pub async fn state_vector(&self) -> StateVector {
        self.session.doc.lock().await.state_vector().clone()
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.session.transport.destroy();
    }
}
