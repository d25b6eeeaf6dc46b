//! Wire types for the control channel.
//!
//! The channel only moves strings: the orchestrator sends a JSON
//! [`Instruction`] and gets back a JSON [`Response`]. Anything an instance
//! wants to tell the orchestrator unprompted is queued as a [`Message`] and
//! collected with [`Instruction::TakeMessages`].

use serde::{Deserialize, Serialize};

use crate::codec::Chunk;
use crate::fixed::Ticks;
use crate::id::{ExportId, InstanceId, JobId, TransferId};
use crate::job::JobProgress;
use crate::loss::LossTally;
use crate::registry::RegistryStatus;
use crate::validation::ValidationResult;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    /// RGB colour used when the message is shown to players.
    pub fn color(self) -> [u8; 3] {
        match self {
            Severity::Info => [255, 255, 255],
            Severity::Success => [0, 255, 0],
            Severity::Warning => [255, 200, 0],
            Severity::Error => [255, 0, 0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub message: String,
    pub severity: Severity,
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    Lock {
        platform: String,
    },
    Unlock {
        platform: String,
    },
    /// Lock must already be held; the export is scanned over several ticks.
    StartExport {
        platform: String,
        export_id: ExportId,
    },
    ExportStatus {
        export_id: ExportId,
    },
    FetchChunk {
        export_id: ExportId,
        index: u32,
    },
    /// Open a reassembly session before the first chunk is pushed.
    BeginImport {
        transfer_id: TransferId,
        platform: String,
        total: u32,
        digest: u64,
    },
    PushChunk {
        platform: String,
        chunk: Chunk,
    },
    TakeMessages,
    DeletePlatform {
        platform: String,
    },
    Announce {
        message: String,
        severity: Severity,
    },
    SetBudget {
        export_batch_size: Option<usize>,
        import_batch_size: Option<usize>,
        sync_mode: Option<bool>,
    },
    Status,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BadInstruction,
    Lock,
    Export,
    NotFound,
    Reassembly,
    ChunkTimeout,
    Decode,
    Import,
    World,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl ToString) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportState {
    Running { progress: Option<JobProgress> },
    Ready { platform: String, chunk_count: u32, digest: u64, bytes: usize },
    Failed { reason: String },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Locked { frozen: usize },
    Unlocked { restored: usize, platform_present: bool },
    ExportStarted { job: JobId },
    Export(ExportState),
    Chunk(Chunk),
    ChunkAccepted { received: u32, total: u32 },
    ImportQueued { job: JobId },
    Messages(Vec<Message>),
    Status(RegistryStatus),
    Error(RemoteError),
}

impl Response {
    /// Convert an `Error` response into a `Result`.
    pub fn into_result(self) -> Result<Response, RemoteError> {
        match self {
            Response::Error(err) => Err(err),
            other => Ok(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Inter-process messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Ask the orchestrator to move an export to another instance.
    RequestTransfer {
        export_id: ExportId,
        destination: InstanceId,
    },
    PlatformExported {
        platform: String,
        instance: InstanceId,
        export_id: ExportId,
        chunk_count: u32,
        digest: u64,
        timestamp: Ticks,
    },
    ExportFailed {
        platform: String,
        export_id: ExportId,
        reason: String,
    },
    /// Import could not get past a structural failure, or its chunk
    /// session timed out (`kind` is then [`ErrorKind::ChunkTimeout`]).
    ImportFailed {
        transfer_id: TransferId,
        platform: String,
        kind: ErrorKind,
        reason: String,
    },
    ValidationReport {
        transfer_id: TransferId,
        platform: String,
        success: bool,
        result: ValidationResult,
        losses: LossTally,
    },
    RequestDeleteSource {
        platform: String,
    },
    RequestUnlockSource {
        platform: String,
    },
    StatusUpdate(StatusUpdate),
}
