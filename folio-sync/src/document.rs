//! Client-side document state.
//!
//! Holds one document's state vector, the local origin's clock and the
//! current content snapshot. Local edits produce whole-content replacement
//! updates:
//!
//! ```text
//! ┌───────┬───────────┬───────┬──────────────┬──────────────────┬────────────┐
//! │ count │ client id │ clock │ utf-16 units │ len-prefixed str │ delete set │
//! │ = 1   │ varuint   │ var   │ varuint      │ varuint + bytes  │ = 0        │
//! └───────┴───────────┴───────┴──────────────┴──────────────────┴────────────┘
//! ```
//!
//! Merge resolution stays with the server. Two replicas editing the same
//! document offline are sequenced, not merged: the last update the server
//! processes wins.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::protocol::{encode_state_vector, read_state_vector};
use crate::state_vector::StateVector;
use crate::varint::{encode_bytes, encode_string, encode_var_uint, CodecError, VarReader};

/// Host-side document (page) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub u64);

impl DocumentId {
    /// Path segment appended to the sync server URL.
    pub fn path_segment(&self) -> String {
        format!("page-{}", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

impl From<u64> for DocumentId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Process-wide client id source, seeded from wall-clock milliseconds.
fn client_id_counter() -> &'static AtomicU64 {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    COUNTER.get_or_init(|| {
        let seed = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        AtomicU64::new(seed)
    })
}

/// Allocate a fresh client id.
pub fn next_client_id() -> u64 {
    client_id_counter().fetch_add(1, Ordering::Relaxed) + 1
}

/// Decoded view of a whole-content update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUpdate {
    pub client_id: u64,
    pub clock: u64,
    /// Content length in UTF-16 code units
    pub content_len: u64,
    pub content: String,
}

impl ContentUpdate {
    /// Encode as a single-struct update with an empty delete set.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.content.len() + 16);
        encode_var_uint(1, &mut out);
        encode_var_uint(self.client_id, &mut out);
        encode_var_uint(self.clock, &mut out);
        encode_var_uint(self.content_len, &mut out);
        encode_string(&self.content, &mut out);
        encode_var_uint(0, &mut out);
        out
    }

    /// Decode the layout produced by [`ContentUpdate::encode`].
    pub fn decode(update: &[u8]) -> Result<Self, CodecError> {
        let mut reader = VarReader::new(update);
        let count = reader.read_var_uint();
        if count != 1 {
            return Err(CodecError::UnexpectedStructCount(count));
        }
        let client_id = reader.read_var_uint();
        let clock = reader.read_var_uint();
        let content_len = reader.read_var_uint();
        let content = reader.read_string()?;
        Ok(Self {
            client_id,
            clock,
            content_len,
            content,
        })
    }
}

// An exhausted reader would otherwise decode as zero / empty.
fn ensure_more(reader: &VarReader<'_>) -> Result<(), CodecError> {
    if reader.is_empty() {
        return Err(CodecError::Truncated {
            needed: 1,
            available: 0,
        });
    }
    Ok(())
}

fn utf16_len(s: &str) -> u64 {
    s.encode_utf16().count() as u64
}

/// In-memory CRDT state for one document.
#[derive(Debug, Clone)]
pub struct DocumentState {
    client_id: u64,
    clock: u64,
    state_vector: StateVector,
    content: String,
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentState {
    /// Empty state with a freshly allocated client id.
    pub fn new() -> Self {
        Self::with_client_id(next_client_id())
    }

    /// Empty state for a fixed client id.
    pub fn with_client_id(client_id: u64) -> Self {
        Self {
            client_id,
            clock: 0,
            state_vector: StateVector::new(),
            content: String::new(),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Local origin's clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Seed a document that has no persisted state.
    pub fn initialize_from_seed(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.clock = 1;
        self.state_vector.set(self.client_id, self.clock);
    }

    /// Replace the content. Returns the update to ship, or `None` if unchanged.
    pub fn set_local_content(&mut self, new_content: &str) -> Option<Vec<u8>> {
        if new_content == self.content {
            return None;
        }
        self.content = new_content.to_owned();
        self.clock += 1;
        self.state_vector.set(self.client_id, self.clock);
        Some(self.current_update().encode())
    }

    fn current_update(&self) -> ContentUpdate {
        ContentUpdate {
            client_id: self.client_id,
            clock: self.clock,
            content_len: utf16_len(&self.content),
            content: self.content.clone(),
        }
    }

    /// Update carrying our current content if `remote` is behind our clock.
    pub fn encode_update_since(&self, remote: &StateVector) -> Option<Vec<u8>> {
        if self.clock == 0 || remote.get(self.client_id) >= self.clock {
            return None;
        }
        Some(self.current_update().encode())
    }

    /// Note a remote update. The server owns the merged result, so only the
    /// struct count is inspected. Returns `false` for empty or malformed input.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> bool {
        if update.is_empty() {
            return false;
        }
        let mut reader = VarReader::new(update);
        let count = reader.read_var_uint();
        count > 0
    }

    /// Take on the content of another origin's whole-content update.
    ///
    /// Updates from our own origin, or older than what the state vector
    /// already records for their origin, are ignored. Returns `true` if the
    /// visible content changed.
    pub fn adopt_remote_content(&mut self, update: &ContentUpdate) -> bool {
        if update.client_id == self.client_id
            || update.clock < self.state_vector.get(update.client_id)
        {
            return false;
        }
        self.state_vector.observe(update.client_id, update.clock);
        if update.content == self.content {
            return false;
        }
        self.content = update.content.clone();
        true
    }

    /// Record another origin's clock without touching the content.
    pub fn observe_remote_clock(&mut self, update: &ContentUpdate) {
        if update.client_id != self.client_id {
            self.state_vector.observe(update.client_id, update.clock);
        }
    }

    /// Raise local clocks to the remote ones; never lowers a clock.
    pub fn merge_state_vector(&mut self, remote: &StateVector) {
        self.state_vector.merge(remote);
    }

    /// `[varuint sv length][state vector][length-prefixed content]`
    pub fn export_state(&self) -> Vec<u8> {
        let sv = encode_state_vector(&self.state_vector);
        let mut out = Vec::with_capacity(sv.len() + self.content.len() + 8);
        encode_bytes(&sv, &mut out);
        encode_string(&self.content, &mut out);
        out
    }

    /// Restore from [`DocumentState::export_state`] output, keeping our client id.
    ///
    /// On error `self` is left untouched.
    pub fn restore_state(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let mut reader = VarReader::new(data);
        ensure_more(&reader)?;
        let sv_bytes = reader.read_bytes()?;
        let mut sv_reader = VarReader::new(sv_bytes);
        ensure_more(&sv_reader)?;
        let state_vector = read_state_vector(&mut sv_reader)?;
        ensure_more(&reader)?;
        let content = reader.read_string()?;

        self.clock = self.clock.max(state_vector.get(self.client_id));
        self.state_vector = state_vector;
        if self.clock > 0 {
            self.state_vector.observe(self.client_id, self.clock);
        }
        self.content = content;
        Ok(())
    }

    /// Build a state from an exported snapshot with a new client id.
    pub fn from_exported(data: &[u8]) -> Result<Self, CodecError> {
        let mut doc = Self::new();
        doc.restore_state(data)?;
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_document_id_path_segment() {
        assert_eq!(DocumentId(42).path_segment(), "page-42");
        assert_eq!(DocumentId::from(7).to_string(), "page-7");
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = DocumentState::new();
        let b = DocumentState::new();
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_initialize_from_seed() {
        let mut doc = DocumentState::with_client_id(10);
        doc.initialize_from_seed("hello");
        assert_eq!(doc.content(), "hello");
        assert_eq!(doc.clock(), 1);
        assert_eq!(doc.state_vector().get(10), 1);
    }

    #[test]
    fn test_set_local_content_generates_update() {
        let mut doc = DocumentState::with_client_id(10);
        doc.initialize_from_seed("hello");

        let update = doc.set_local_content("hello world").unwrap();
        assert_eq!(doc.clock(), 2);
        assert_eq!(doc.state_vector().get(10), 2);

        let decoded = ContentUpdate::decode(&update).unwrap();
        assert_eq!(decoded.client_id, 10);
        assert_eq!(decoded.clock, 2);
        assert_eq!(decoded.content_len, 11);
        assert_eq!(decoded.content, "hello world");
        // Trailing empty delete set
        assert_eq!(update.last(), Some(&0));
    }

    #[test]
    fn test_same_content_is_noop() {
        let mut doc = DocumentState::with_client_id(10);
        doc.initialize_from_seed("a");
        assert!(doc.set_local_content("b").is_some());
        let clock = doc.clock();
        assert!(doc.set_local_content("b").is_none());
        assert_eq!(doc.clock(), clock);
    }

    #[test]
    fn test_content_len_counts_utf16_units() {
        let mut doc = DocumentState::with_client_id(1);
        let update = doc.set_local_content("a😀").unwrap();
        let decoded = ContentUpdate::decode(&update).unwrap();
        assert_eq!(decoded.content_len, 3);
        assert_eq!(decoded.content, "a😀");
    }

    #[test]
    fn test_apply_remote_update() {
        let mut doc = DocumentState::with_client_id(1);
        assert!(!doc.apply_remote_update(&[]));
        assert!(!doc.apply_remote_update(&[0]));
        assert!(doc.apply_remote_update(&[1, 5, 1]));
        // Content is not touched
        assert_eq!(doc.content(), "");
    }

    #[test]
    fn test_adopt_remote_content() {
        let mut doc = DocumentState::with_client_id(1);
        doc.initialize_from_seed("local");

        let remote = ContentUpdate {
            client_id: 2,
            clock: 4,
            content_len: 6,
            content: "remote".to_string(),
        };
        assert!(doc.adopt_remote_content(&remote));
        assert_eq!(doc.content(), "remote");
        assert_eq!(doc.state_vector().get(2), 4);
        // Local clock untouched
        assert_eq!(doc.clock(), 1);

        // Replayed or stale updates are ignored
        let stale = ContentUpdate {
            clock: 3,
            content: "older".to_string(),
            ..remote.clone()
        };
        assert!(!doc.adopt_remote_content(&remote));
        assert!(!doc.adopt_remote_content(&stale));
        assert_eq!(doc.content(), "remote");

        // Echo of our own edit
        let own = ContentUpdate {
            client_id: 1,
            clock: 9,
            content_len: 4,
            content: "echo".to_string(),
        };
        assert!(!doc.adopt_remote_content(&own));
    }

    #[test]
    fn test_observe_remote_clock_keeps_content() {
        let mut doc = DocumentState::with_client_id(1);
        doc.initialize_from_seed("mine");

        let remote = ContentUpdate {
            client_id: 2,
            clock: 7,
            content_len: 4,
            content: "peer".to_string(),
        };
        doc.observe_remote_clock(&remote);
        assert_eq!(doc.content(), "mine");
        assert_eq!(doc.state_vector().get(2), 7);

        let own = ContentUpdate {
            client_id: 1,
            clock: 40,
            ..remote
        };
        doc.observe_remote_clock(&own);
        assert_eq!(doc.state_vector().get(1), 1);
    }

    #[test]
    fn test_merge_state_vector_keeps_local_ahead() {
        let mut doc = DocumentState::with_client_id(1);
        doc.initialize_from_seed("x");
        doc.set_local_content("y");
        let remote: StateVector = [(1, 1), (2, 9)].into_iter().collect();
        doc.merge_state_vector(&remote);
        assert_eq!(doc.state_vector().get(1), 2);
        assert_eq!(doc.state_vector().get(2), 9);
    }

    #[test]
    fn test_encode_update_since() {
        let mut doc = DocumentState::with_client_id(3);
        assert!(doc.encode_update_since(&StateVector::new()).is_none());

        doc.initialize_from_seed("seed");
        let update = doc.encode_update_since(&StateVector::new()).unwrap();
        assert_eq!(ContentUpdate::decode(&update).unwrap().clock, 1);

        let caught_up: StateVector = [(3, 1)].into_iter().collect();
        assert!(doc.encode_update_since(&caught_up).is_none());
    }

    #[test]
    fn test_restore_recomputes_clock() {
        let mut doc = DocumentState::with_client_id(5);
        doc.initialize_from_seed("one");
        doc.set_local_content("two");
        doc.set_local_content("three");
        let exported = doc.export_state();

        let mut restored = DocumentState::with_client_id(5);
        restored.restore_state(&exported).unwrap();
        assert_eq!(restored.clock(), 3);
        assert_eq!(restored.content(), "three");

        // Next edit continues the sequence
        let update = restored.set_local_content("four").unwrap();
        assert_eq!(ContentUpdate::decode(&update).unwrap().clock, 4);
    }

    #[test]
    fn test_restore_never_rewinds_local_clock() {
        let mut older = DocumentState::with_client_id(5);
        older.initialize_from_seed("old");
        let stale = older.export_state();

        let mut doc = DocumentState::with_client_id(5);
        doc.initialize_from_seed("a");
        doc.set_local_content("b");
        doc.set_local_content("c");
        doc.restore_state(&stale).unwrap();
        assert_eq!(doc.clock(), 3);
        assert_eq!(doc.state_vector().get(5), 3);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let mut doc = DocumentState::with_client_id(5);
        doc.initialize_from_seed("keep");
        assert!(doc.restore_state(&[0x40, 1, 2]).is_err());
        assert!(doc.restore_state(&[]).is_err());
        assert_eq!(doc.content(), "keep");
    }

    proptest! {
        #[test]
        fn prop_export_restore_roundtrip(
            entries in proptest::collection::btree_map(0u64..1_000, 0u64..1_000, 0..8),
            content in ".*",
        ) {
            let mut doc = DocumentState::with_client_id(2_000);
            doc.initialize_from_seed(content.clone());
            let remote: StateVector = entries.into_iter().collect();
            doc.merge_state_vector(&remote);

            let mut restored = DocumentState::with_client_id(2_000);
            restored.restore_state(&doc.export_state()).unwrap();
            prop_assert_eq!(restored.state_vector(), doc.state_vector());
            prop_assert_eq!(restored.content(), doc.content());
            prop_assert_eq!(restored.clock(), doc.clock());
        }
    }
}
