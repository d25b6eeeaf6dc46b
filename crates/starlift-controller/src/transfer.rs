//! Transfer records and their state machine.
//!
//! ```text
//! Created -> Locked -> Exporting -> Exported -> Importing -> Validating -> Completed
//!    |          |          |            |            |             |
//!    +----------+----------+--> Failed  +------------+-------------+--> RolledBack
//! ```
//!
//! Failures before anything has left the source end in `Failed`. Once a
//! payload exists the only way out besides success is `RolledBack`.

use serde::{Deserialize, Serialize};
use starlift_core::id::{ExportId, InstanceId, TransferId};
use starlift_core::loss::LossTally;
use starlift_core::validation::ValidationResult;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Created,
    Locked,
    Exporting,
    Exported,
    Importing,
    Validating,
    Completed,
    RolledBack,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::RolledBack | TransferState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::Created => "created",
            TransferState::Locked => "locked",
            TransferState::Exporting => "exporting",
            TransferState::Exported => "exported",
            TransferState::Importing => "importing",
            TransferState::Validating => "validating",
            TransferState::Completed => "completed",
            TransferState::RolledBack => "rolled_back",
            TransferState::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Created, Locked)
                | (Created, Failed)
                | (Locked, Exporting)
                | (Locked, Failed)
                | (Exporting, Exported)
                | (Exporting, Failed)
                | (Exported, Importing)
                | (Exported, RolledBack)
                | (Importing, Validating)
                | (Importing, RolledBack)
                | (Validating, Completed)
                | (Validating, RolledBack)
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transfer ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Lock,
    Export,
    ChunkTransport,
    ChunkTimeout,
    Import,
    Validation,
    ValidationTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transfer transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: TransferState,
    pub to: TransferState,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One state change, timestamped with absolute, elapsed and delta time in
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transfer_id: TransferId,
    pub platform: String,
    pub previous: Option<TransferState>,
    pub state: TransferState,
    pub at_ms: u64,
    /// Since the transfer was created.
    pub elapsed_ms: u64,
    /// Since the transfer's previous event.
    pub delta_ms: u64,
    pub failure: Option<FailureKind>,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub platform: String,
    pub source: InstanceId,
    pub destination: InstanceId,
    pub export_id: ExportId,
    pub state: TransferState,
    pub created_ms: u64,
    pub last_event_ms: u64,
    /// When the record entered `Importing`; the validation timeout runs
    /// from here.
    pub importing_since_ms: Option<u64>,
    pub chunk_count: u32,
    pub digest: u64,
    pub failure: Option<FailureKind>,
    pub validation: Option<ValidationResult>,
    pub losses: Option<LossTally>,
}

impl TransferRecord {
    /// A new record in `Created`, with its creation event.
    pub fn create(
        id: TransferId,
        platform: &str,
        source: InstanceId,
        destination: InstanceId,
        export_id: ExportId,
        now_ms: u64,
    ) -> (Self, TransactionEvent) {
        let record = Self {
            id,
            platform: platform.to_string(),
            source,
            destination,
            export_id,
            state: TransferState::Created,
            created_ms: now_ms,
            last_event_ms: now_ms,
            importing_since_ms: None,
            chunk_count: 0,
            digest: 0,
            failure: None,
            validation: None,
            losses: None,
        };
        let event = TransactionEvent {
            transfer_id: id,
            platform: record.platform.clone(),
            previous: None,
            state: TransferState::Created,
            at_ms: now_ms,
            elapsed_ms: 0,
            delta_ms: 0,
            failure: None,
            detail: format!("{source} -> {destination}"),
        };
        (record, event)
    }

    pub fn transition(
        &mut self,
        to: TransferState,
        now_ms: u64,
        detail: impl Into<String>,
    ) -> Result<TransactionEvent, IllegalTransition> {
        self.transition_inner(to, None, now_ms, detail.into())
    }

    /// Move to a terminal failure state, recording why.
    pub fn fail(
        &mut self,
        to: TransferState,
        kind: FailureKind,
        now_ms: u64,
        detail: impl Into<String>,
    ) -> Result<TransactionEvent, IllegalTransition> {
        self.transition_inner(to, Some(kind), now_ms, detail.into())
    }

    fn transition_inner(
        &mut self,
        to: TransferState,
        failure: Option<FailureKind>,
        now_ms: u64,
        detail: String,
    ) -> Result<TransactionEvent, IllegalTransition> {
        if !self.state.can_transition_to(to) {
            return Err(IllegalTransition { from: self.state, to });
        }
        let now_ms = now_ms.max(self.last_event_ms);
        let event = TransactionEvent {
            transfer_id: self.id,
            platform: self.platform.clone(),
            previous: Some(self.state),
            state: to,
            at_ms: now_ms,
            elapsed_ms: now_ms - self.created_ms,
            delta_ms: now_ms - self.last_event_ms,
            failure,
            detail,
        };
        self.state = to;
        self.last_event_ms = now_ms;
        if to == TransferState::Importing {
            self.importing_since_ms = Some(now_ms);
        }
        if failure.is_some() {
            self.failure = failure;
        }
        Ok(event)
    }

    /// Whether the validation window has closed without a report.
    pub fn validation_overdue(&self, now_ms: u64, timeout_ms: u64) -> bool {
        matches!(self.state, TransferState::Importing | TransferState::Validating)
            && self
                .importing_since_ms
                .is_some_and(|since| now_ms.saturating_sub(since) >= timeout_ms)
    }
}
