//! WebSocket transport for one document session.
//!
//! State machine:
//! ```text
//!                 connect()
//! Disconnected ─────────────► Connecting ──open──► Connected
//!      ▲                          │                   │ auth ok / no credentials
//!      │ close / exhausted        │ failure           ▼
//!      │                          ▼             Authenticated ──step2──► Synced
//!      └──────── reconnect ◄── Error ◄──────── failure / auth rejected
//! ```
//!
//! One background task owns the socket; a timer task handles reconnection
//! with linear backoff (`base_delay × (attempt + 1)`), at most
//! `max_attempts` times. Every connection carries a generation number and
//! tasks whose generation is no longer current stop touching shared state.
//!
//! Delivery is not acknowledged here: `send_update` reports whether the frame
//! was handed to a live connection, nothing more.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::document::DocumentId;
use crate::protocol::{self, SyncMessage};
use crate::state_vector::StateVector;

/// Connection state of a [`TransportClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, handshake not finished
    Connected,
    Authenticated,
    /// Step1/Step2 handshake complete, live updates flowing
    Synced,
    Error,
}

impl ConnectionState {
    /// A connection exists or is being established.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Authenticated | Self::Synced
        )
    }
}

/// Events delivered to the owner of a [`TransportClient`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Any inbound message other than `Unknown`
    Message(SyncMessage),
    /// Backoff gave up; only an explicit `connect()` restarts.
    ReconnectExhausted { attempts: u32 },
}

/// Linear reconnection backoff.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay unit (default: 3s)
    pub base_delay: Duration,
    /// Attempts before giving up (default: 5)
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(3000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before the reconnection that follows `attempt` earlier retries.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Sync server base URL, e.g. `ws://host:3032`
    pub server_url: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3032".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl TransportConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Config for testing (short backoff).
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(20),
                max_attempts: 5,
            },
        }
    }

    /// `<server_url>/page-<id>`
    pub fn endpoint(&self, doc_id: DocumentId) -> String {
        format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            doc_id.path_segment()
        )
    }
}

/// Supplies the bearer credential for the auth handshake.
pub trait CredentialProvider: Send + Sync {
    /// `None` skips authentication.
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed credential.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(Option<String>);

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }

    /// `"<id>:<secret>"` API token pair.
    pub fn from_token_pair(id: &str, secret: &str) -> Self {
        Self(Some(format!("{id}:{secret}")))
    }
}

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport has been destroyed")]
    Destroyed,

    #[error("no tokio runtime available to drive the connection")]
    NoRuntime,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What the socket task does after handling an inbound frame.
enum FrameAction {
    Continue,
    Reply(Vec<u8>),
    Close,
}

struct Shared {
    doc_id: DocumentId,
    config: TransportConfig,
    credentials: Arc<dyn CredentialProvider>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Writer half of the live connection, tagged with its generation
    outgoing: Mutex<Option<(u64, mpsc::UnboundedSender<Message>)>>,
    generation: AtomicU64,
    attempts: AtomicU32,
    auth_rejected: AtomicBool,
    destroyed: AtomicBool,
    connection_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Move to `next` if `generation` is still live. State and event are
    /// published under the same lock, so observers see transitions in order.
    fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if !self.is_current(generation) || *state == next {
                return false;
            }
            log::debug!("{}: {:?} -> {:?}", self.doc_id, *state, next);
            *state = next;
            let _ = self.event_tx.send(TransportEvent::StateChanged(next));
            true
        })
    }

    fn emit(&self, generation: u64, event: TransportEvent) {
        if self.is_current(generation) {
            let _ = self.event_tx.send(event);
        }
    }

    fn send_frame(&self, frame: Vec<u8>) -> bool {
        let outgoing = lock(&self.outgoing);
        match outgoing.as_ref() {
            Some((generation, tx)) if self.is_current(*generation) => {
                tx.send(Message::Binary(frame.into())).is_ok()
            }
            _ => false,
        }
    }

    /// Invalidate the live connection and any pending timer.
    fn shutdown(&self, destroy: bool) {
        if destroy {
            self.destroyed.store(true, Ordering::SeqCst);
        }
        self.state_tx.send_if_modified(|state| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            if *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Disconnected;
            let _ = self
                .event_tx
                .send(TransportEvent::StateChanged(ConnectionState::Disconnected));
            true
        });
        if let Some(timer) = lock(&self.reconnect_task).take() {
            timer.abort();
        }
        // Dropping the writer makes the socket task send a close frame and exit.
        lock(&self.outgoing).take();
        if destroy {
            if let Some(task) = lock(&self.connection_task).take() {
                task.abort();
            }
        }
    }
}

/// Begin a connection unless one is already active. With `expected`, only
/// proceed if no newer connection or shutdown happened since it was taken.
fn start_connection(shared: &Arc<Shared>, expected: Option<u64>) -> bool {
    let mut generation = 0;
    let started = shared.state_tx.send_if_modified(|state| {
        if shared.destroyed.load(Ordering::SeqCst) || state.is_active() {
            return false;
        }
        if let Some(expected) = expected {
            if !shared.is_current(expected) {
                return false;
            }
        }
        generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *state = ConnectionState::Connecting;
        let _ = shared
            .event_tx
            .send(TransportEvent::StateChanged(ConnectionState::Connecting));
        true
    });
    if !started {
        return false;
    }

    let task = tokio::spawn(run_connection(Arc::clone(shared), generation));
    if let Some(stale) = lock(&shared.connection_task).replace(task) {
        stale.abort();
    }
    true
}

fn schedule_reconnect(shared: &Arc<Shared>, generation: u64) {
    if shared.destroyed.load(Ordering::SeqCst)
        || shared.auth_rejected.load(Ordering::SeqCst)
        || !shared.is_current(generation)
    {
        return;
    }

    let attempt = shared.attempts.load(Ordering::SeqCst);
    let policy = &shared.config.reconnect;
    if attempt >= policy.max_attempts {
        log::warn!(
            "{}: giving up after {attempt} reconnect attempts",
            shared.doc_id
        );
        shared.transition(generation, ConnectionState::Disconnected);
        shared.emit(generation, TransportEvent::ReconnectExhausted { attempts: attempt });
        return;
    }

    let delay = policy.delay_for(attempt);
    log::debug!(
        "{}: reconnecting in {delay:?} (attempt {})",
        shared.doc_id,
        attempt + 1
    );
    let timer_shared = Arc::clone(shared);
    let timer = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        timer_shared.attempts.fetch_add(1, Ordering::SeqCst);
        start_connection(&timer_shared, Some(generation));
    });
    if let Some(previous) = lock(&shared.reconnect_task).replace(timer) {
        previous.abort();
    }
}

/// Interpret one inbound frame.
fn handle_frame(shared: &Shared, generation: u64, data: &[u8]) -> FrameAction {
    let message = protocol::parse_message(data);
    log::debug!(
        "{}: received {} ({} bytes)",
        shared.doc_id,
        message.kind(),
        data.len()
    );

    match message {
        SyncMessage::Auth { success: true, .. } => {
            log::info!("{}: authenticated", shared.doc_id);
            shared.transition(generation, ConnectionState::Authenticated);
            FrameAction::Reply(protocol::create_step1(&StateVector::new()))
        }
        SyncMessage::Auth {
            success: false,
            message: reason,
        } => {
            log::warn!(
                "{}: authentication rejected: {}",
                shared.doc_id,
                reason.as_deref().unwrap_or("no reason given")
            );
            shared.auth_rejected.store(true, Ordering::SeqCst);
            shared.transition(generation, ConnectionState::Error);
            shared.emit(
                generation,
                TransportEvent::Message(SyncMessage::Auth {
                    success: false,
                    message: reason,
                }),
            );
            FrameAction::Close
        }
        SyncMessage::Step2(_) => {
            shared.transition(generation, ConnectionState::Synced);
            shared.emit(generation, TransportEvent::Message(message));
            FrameAction::Continue
        }
        SyncMessage::Unknown(byte) => {
            log::debug!("{}: ignoring unknown message {byte:?}", shared.doc_id);
            FrameAction::Continue
        }
        other => {
            shared.emit(generation, TransportEvent::Message(other));
            FrameAction::Continue
        }
    }
}

async fn run_connection(shared: Arc<Shared>, generation: u64) {
    let url = shared.config.endpoint(shared.doc_id);
    log::debug!("Connecting to {url}");

    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            log::warn!("Connection to {url} failed: {e}");
            if shared.is_current(generation) {
                shared.transition(generation, ConnectionState::Error);
                schedule_reconnect(&shared, generation);
            }
            return;
        }
    };

    let (mut sink, mut stream) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    {
        let mut outgoing = lock(&shared.outgoing);
        if !shared.is_current(generation) {
            return;
        }
        *outgoing = Some((generation, out_tx));
    }

    shared.attempts.store(0, Ordering::SeqCst);
    shared.transition(generation, ConnectionState::Connected);
    log::info!("Connected to {url}");

    let handshake = match shared.credentials.bearer_token() {
        Some(token) => protocol::create_auth_message(&token),
        None => protocol::create_step1(&StateVector::new()),
    };
    let mut failed = sink.send(Message::Binary(handshake.into())).await.is_err();

    while !failed {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        log::warn!("{}: write failed: {e}", shared.doc_id);
                        failed = true;
                    }
                }
                None => {
                    // Local disconnect; this generation is already retired.
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    log::debug!("{}: closed by client", shared.doc_id);
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    match handle_frame(&shared, generation, &data) {
                        FrameAction::Continue => {}
                        FrameAction::Reply(frame) => {
                            if sink.send(Message::Binary(frame.into())).await.is_err() {
                                failed = true;
                            }
                        }
                        FrameAction::Close => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    log::debug!("{}: ignoring text frame ({} bytes)", shared.doc_id, text.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    log::info!("{}: server closed connection: {frame:?}", shared.doc_id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("{}: socket error: {e}", shared.doc_id);
                    failed = true;
                }
                None => break,
            },
        }
    }

    if !shared.is_current(generation) {
        return;
    }
    {
        let mut outgoing = lock(&shared.outgoing);
        if matches!(outgoing.as_ref(), Some((g, _)) if *g == generation) {
            outgoing.take();
        }
    }
    if shared.auth_rejected.load(Ordering::SeqCst) {
        // Stay in Error until new credentials and an explicit connect().
        return;
    }
    let next = if failed {
        ConnectionState::Error
    } else {
        ConnectionState::Disconnected
    };
    shared.transition(generation, next);
    schedule_reconnect(&shared, generation);
}

/// Connection to the sync server for a single document.
pub struct TransportClient {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl TransportClient {
    pub fn new(
        doc_id: DocumentId,
        config: TransportConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                doc_id,
                config,
                credentials,
                state_tx,
                event_tx,
                outgoing: Mutex::new(None),
                generation: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                auth_rejected: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                connection_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.take()
    }

    /// Start connecting. Returns `Ok(false)` if a connection is already
    /// active. Resets the reconnect budget and any earlier auth rejection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> Result<bool, TransportError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Destroyed);
        }
        tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        if self.state().is_active() {
            return Ok(false);
        }
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.auth_rejected.store(false, Ordering::SeqCst);
        if let Some(timer) = lock(&self.shared.reconnect_task).take() {
            timer.abort();
        }
        Ok(start_connection(&self.shared, None))
    }

    /// Send an incremental update. `true` if a live connection accepted it.
    pub fn send_update(&self, update: &[u8]) -> bool {
        self.shared.send_frame(protocol::create_update(update))
    }

    /// Answer a server step 1.
    pub fn send_step2(&self, update: &[u8]) -> bool {
        self.shared.send_frame(protocol::create_step2(update))
    }

    /// Ask the server for what we are missing.
    pub fn send_step1(&self, sv: &StateVector) -> bool {
        self.shared.send_frame(protocol::create_step1(sv))
    }

    /// Presence passthrough.
    pub fn send_presence(&self, payload: &[u8]) -> bool {
        self.shared.send_frame(protocol::create_presence(payload))
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Reconnection attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn doc_id(&self) -> DocumentId {
        self.shared.doc_id
    }

    pub fn endpoint(&self) -> String {
        self.shared.config.endpoint(self.shared.doc_id)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Close the socket and cancel pending reconnection. Idempotent;
    /// `connect()` may be called again afterwards.
    pub fn disconnect(&self) {
        self.shared.shutdown(false);
    }

    /// Like `disconnect`, and refuse further `connect()` calls.
    pub fn destroy(&self) {
        self.shared.shutdown(true);
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.shared.shutdown(true);
    }
}
