//! Runtime configuration.
//!
//! Both structs deserialize with every field optional, so a driver can load
//! them from whatever format it already uses and fall back to defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DhtError, Result};
use crate::protocol::MESSAGE_LEN;
use crate::store::DEFAULT_CAPACITY;

/// Per-node table settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Maximum number of pairs each node's local store holds.
    pub capacity: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(DhtError::Config("capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Settings for the TCP substrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// How many times to dial a peer before giving up at startup.
    pub connect_attempts: u32,
    /// Pause between dial attempts, in milliseconds.
    pub connect_backoff_ms: u64,
    /// Largest packet a reader accepts, in bytes.
    pub max_frame_len: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 50,
            connect_backoff_ms: 100,
            max_frame_len: 64 * 1024,
        }
    }
}

impl TcpConfig {
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_attempts == 0 {
            return Err(DhtError::Config("connect_attempts must be at least 1".into()));
        }
        // Room for one encoded message plus frame overhead.
        if self.max_frame_len < 2 * MESSAGE_LEN {
            return Err(DhtError::Config(format!(
                "max_frame_len must be at least {} bytes",
                2 * MESSAGE_LEN
            )));
        }
        Ok(())
    }
}
