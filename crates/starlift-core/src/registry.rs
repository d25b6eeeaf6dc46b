//! Process-wide transfer state.
//!
//! One [`ProcessRegistry`] exists per simulation process, created at start
//! and owned by its [`crate::instance::Instance`]. It holds the lock table,
//! the job scheduler, open reassembly sessions, finished export artifacts
//! and the outbox of messages waiting to be collected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::Chunk;
use crate::config::TransferConfig;
use crate::fixed::Ticks;
use crate::id::{ExportId, InstanceId, JobId};
use crate::job::{JobSummary, Scheduler};
use crate::lock::LockTable;
use crate::protocol::{Message, StatusUpdate};
use crate::reassembly::{ReassemblyTable, SessionSummary};

/// An encoded, chunked export waiting to be fetched.
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub platform: String,
    pub chunks: Vec<Chunk>,
    pub digest: u64,
    pub bytes: usize,
    pub created_at: Ticks,
}

#[derive(Debug, Clone)]
pub enum ExportEntry {
    Running { job: JobId, platform: String },
    Ready(ExportArtifact),
    Failed { platform: String, reason: String },
}

impl ExportEntry {
    pub fn platform(&self) -> &str {
        match self {
            ExportEntry::Running { platform, .. } | ExportEntry::Failed { platform, .. } => {
                platform
            }
            ExportEntry::Ready(artifact) => &artifact.platform,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub export_id: ExportId,
    pub platform: String,
    pub state: String,
}

/// Everything the `Status` instruction reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub instance: InstanceId,
    pub tick: Ticks,
    pub locked: Vec<String>,
    pub jobs: Vec<JobSummary>,
    pub sessions: Vec<SessionSummary>,
    pub exports: Vec<ExportSummary>,
    pub pending_messages: usize,
}

#[derive(Debug)]
pub struct ProcessRegistry {
    pub locks: LockTable,
    pub scheduler: Scheduler,
    pub reassembly: ReassemblyTable,
    pub exports: BTreeMap<ExportId, ExportEntry>,
    pub outbox: Vec<Message>,
    /// Every announcement shown to players, oldest first.
    pub announcements: Vec<StatusUpdate>,
}

impl ProcessRegistry {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            locks: LockTable::new(),
            scheduler: Scheduler::new(config.scheduler),
            reassembly: ReassemblyTable::new(config.transport.chunk_timeout_ticks),
            exports: BTreeMap::new(),
            outbox: Vec::new(),
            announcements: Vec::new(),
        }
    }

    /// Queue a message for the orchestrator.
    pub fn post(&mut self, message: Message) {
        self.outbox.push(message);
    }

    /// Drop every export of `platform`, finished or not. Returns how many
    /// entries went.
    pub fn release_exports(&mut self, platform: &str) -> usize {
        let before = self.exports.len();
        self.exports.retain(|_, entry| entry.platform() != platform);
        before - self.exports.len()
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub fn status(&self, instance: InstanceId, tick: Ticks) -> RegistryStatus {
        RegistryStatus {
            instance,
            tick,
            locked: self.locks.platforms(),
            jobs: self.scheduler.active(),
            sessions: self.reassembly.sessions(),
            exports: self
                .exports
                .iter()
                .map(|(id, entry)| {
                    let (platform, state) = match entry {
                        ExportEntry::Running { platform, .. } => {
                            (platform.clone(), "running".to_string())
                        }
                        ExportEntry::Ready(artifact) => {
                            let state = format!("ready ({} chunks)", artifact.chunks.len());
                            (artifact.platform.clone(), state)
                        }
                        ExportEntry::Failed { platform, reason } => {
                            (platform.clone(), format!("failed: {reason}"))
                        }
                    };
                    ExportSummary {
                        export_id: *id,
                        platform,
                        state,
                    }
                })
                .collect(),
            pending_messages: self.outbox.len(),
        }
    }
}
