//! Session configuration.

use crate::storage::MAX_QUEUE_RETRIES;
use crate::transport::TransportConfig;

/// Environment variable overriding the sync server URL.
pub const SERVER_URL_ENV: &str = "FOLIO_SYNC_URL";

/// Configuration shared by every session of a [`crate::SessionRegistry`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub transport: TransportConfig,
    /// Queue entries retried more often than this are dropped (default: 5)
    pub max_queue_retries: u32,
    /// Capacity of the host event channel (default: 256)
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_queue_retries: MAX_QUEUE_RETRIES,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::new(server_url),
            ..Self::default()
        }
    }

    /// Config for testing (short reconnect backoff).
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::for_testing(server_url),
            ..Self::default()
        }
    }

    /// Defaults, with the server URL taken from `FOLIO_SYNC_URL` when set.
    pub fn from_env() -> Self {
        Self::with_server_override(std::env::var(SERVER_URL_ENV).ok().as_deref())
    }

    fn with_server_override(url: Option<&str>) -> Self {
        match url.map(str::trim) {
            Some(url) if !url.is_empty() => Self::new(url),
            _ => Self::default(),
        }
    }
}
