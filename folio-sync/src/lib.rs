//! # folio-sync: Client-side document synchronization for Folio pages
//!
//! Keeps one page's content in sync with a central sync server over a
//! WebSocket, survives disconnects without losing local edits, and persists
//! document state across restarts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  edits / content   ┌───────────────┐
//! │ Host editor      │ ◄────────────────► │SessionRegistry│
//! └──────────────────┘                    │ (per page)    │
//!                                         └───────┬───────┘
//!                                                 ▼
//! ┌──────────────┐   snapshots / queue   ┌──────────────────┐
//! │ QueueStore   │ ◄──────────────────── │ SyncOrchestrator │
//! │ SnapshotStore│                       └──┬────────────┬──┘
//! └──────────────┘                          ▼            ▼
//!                                  ┌──────────────┐ ┌─────────────────┐
//!                                  │ DocumentState│ │ TransportClient │ ◄──► server
//!                                  └──────────────┘ └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`varint`]: Variable-length integer and length-prefixed string codec
//! - [`state_vector`]: Per-origin logical clocks
//! - [`protocol`]: Sync/auth/presence message framing
//! - [`document`]: Local document state and whole-content updates
//! - [`transport`]: WebSocket connection state machine with reconnect
//! - [`storage`]: Offline queue and snapshot stores (memory, RocksDB)
//! - [`orchestrator`]: Per-document session tying it all together
//! - [`registry`]: Open sessions keyed by document
//! - [`config`]: Session configuration
//!
//! ## Delivery guarantees
//!
//! | Situation | Behaviour |
//! |-----------|-----------|
//! | Edit while synced | Sent immediately |
//! | Edit while offline | Queued, replayed in order after the next sync |
//! | Send fails during replay | Entry kept; dropped after 5 failures |
//! | Process restart | Snapshot restored, queue survives (RocksDB) |

pub mod varint;
pub mod state_vector;
pub mod protocol;
pub mod document;
pub mod transport;
pub mod storage;
pub mod orchestrator;
pub mod registry;
pub mod config;

// Re-exports for convenience
pub use config::SyncConfig;
pub use document::{ContentUpdate, DocumentId, DocumentState};
pub use orchestrator::{EditOutcome, SyncError, SyncEvent, SyncOrchestrator};
pub use protocol::{parse_message, SyncMessage};
pub use registry::SessionRegistry;
pub use state_vector::StateVector;
pub use storage::{
    DocumentSnapshot, MemoryStore, QueueStore, QueuedUpdate, RocksStore, SnapshotStore,
    StoreConfig, StoreError,
};
pub use transport::{
    ConnectionState, CredentialProvider, ReconnectPolicy, StaticCredentials, TransportClient,
    TransportConfig, TransportError, TransportEvent,
};
pub use varint::CodecError;
