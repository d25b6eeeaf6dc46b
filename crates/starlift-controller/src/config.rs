//! Orchestrator configuration.
//!
//! Loaded with the same extension-driven loader as the per-process
//! [`TransferConfig`](starlift_core::config::TransferConfig), so a
//! deployment can keep both in `.ron`, `.toml` or `.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use starlift_core::config::{ConfigError, load_file};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// How long to wait for a validation report after import starts.
    pub validation_timeout_ms: u64,
    /// Retries per chunk before the transport is given up.
    pub max_chunk_resends: u32,
    /// Chunks pushed to the destination per poll.
    pub chunks_per_poll: usize,
    /// Reassembled payloads kept, oldest evicted first.
    pub snapshot_cache_capacity: usize,
    /// Delete the half-built destination platform when rolling back.
    pub cleanup_destination_on_rollback: bool,
    /// Append every transaction event to this file as JSON lines.
    pub transaction_log_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            validation_timeout_ms: 120_000,
            max_chunk_resends: 3,
            chunks_per_poll: 8,
            snapshot_cache_capacity: 8,
            cleanup_destination_on_rollback: false,
            transaction_log_path: None,
        }
    }
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_file(path)
    }
}
