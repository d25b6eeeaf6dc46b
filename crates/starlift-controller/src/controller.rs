//! The transfer orchestrator.
//!
//! [`TransferController`] owns one control channel per simulation process
//! and drives each transfer through its state machine:
//!
//! 1. lock the source and start its export;
//! 2. on `PlatformExported`, pull every chunk, verify the digest and keep
//!    the payload in the [`SnapshotStore`];
//! 3. open a reassembly session on the destination and push chunks a few
//!    per poll, resending after transient channel failures;
//! 4. wait (bounded) for the destination's `ValidationReport`;
//! 5. delete the source on success, unlock it otherwise.
//!
//! Nothing here blocks. The host calls [`TransferController::poll`] with a
//! millisecond clock; each poll drains every instance's outbox, advances
//! pending transports and enforces the validation timeout.

use std::collections::BTreeMap;

use starlift_core::codec::{Chunk, reassemble};
use starlift_core::id::{ExportId, InstanceId, JobId, TransferId, digest};
use starlift_core::loss::LossTally;
use starlift_core::protocol::{
    ErrorKind, ExportState, Instruction, Message, RemoteError, Response, Severity, StatusUpdate,
};
use starlift_core::validation::ValidationResult;

use crate::channel::{ChannelError, ControlChannel, call};
use crate::config::ControllerConfig;
use crate::log::{LogError, TransactionLog};
use crate::store::{SnapshotStore, StoredSnapshot};
use crate::transfer::{
    FailureKind, IllegalTransition, TransactionEvent, TransferRecord, TransferState,
};

// ===========================================================================
// Errors
// ===========================================================================

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("no channel registered for {0}")]
    UnknownInstance(InstanceId),

    #[error("source and destination are both {0}")]
    SameInstance(InstanceId),

    #[error("platform '{platform}' already has {transfer} in flight")]
    TransferInFlight { platform: String, transfer: TransferId },

    #[error("unknown {0}")]
    UnknownTransfer(TransferId),

    #[error(transparent)]
    Transition(#[from] IllegalTransition),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Log(#[from] LogError),
}

// ===========================================================================
// Bookkeeping
// ===========================================================================

/// Chunks on their way to the destination.
#[derive(Debug)]
struct Outgoing {
    chunks: Vec<Chunk>,
    digest: u64,
    /// Whether the destination has opened its reassembly session.
    begun: bool,
    next: usize,
    /// Consecutive transient failures on the current step.
    resends: u32,
}

enum PumpOutcome {
    Waiting,
    Queued(JobId),
    Failed(FailureKind, String),
}

impl Outgoing {
    fn retry_or_fail(&mut self, err: ChannelError, max_resends: u32) -> PumpOutcome {
        if err.is_transient() && self.resends < max_resends {
            self.resends += 1;
            tracing::debug!(
                chunk = self.next,
                resends = self.resends,
                error = %err,
                "chunk_resend_scheduled"
            );
            return PumpOutcome::Waiting;
        }
        match err {
            ChannelError::Remote(RemoteError {
                kind: ErrorKind::ChunkTimeout,
                message,
            }) => PumpOutcome::Failed(FailureKind::ChunkTimeout, message),
            ChannelError::Remote(RemoteError {
                kind: ErrorKind::Import | ErrorKind::Decode,
                message,
            }) => PumpOutcome::Failed(FailureKind::Import, message),
            other => PumpOutcome::Failed(FailureKind::ChunkTransport, other.to_string()),
        }
    }
}

#[derive(Debug)]
struct Transfer {
    record: TransferRecord,
    outgoing: Option<Outgoing>,
    /// A reassembly session (and possibly a platform) exists on the
    /// destination.
    destination_touched: bool,
}

type Channels = BTreeMap<InstanceId, Box<dyn ControlChannel>>;

fn send(
    channels: &mut Channels,
    to: InstanceId,
    instruction: &Instruction,
) -> Result<Response, ChannelError> {
    let channel = channels.get_mut(&to).ok_or(ChannelError::Unreachable(to))?;
    call(channel.as_mut(), instruction)
}

fn fetch_chunks(
    channels: &mut Channels,
    source: InstanceId,
    export_id: ExportId,
    count: u32,
    max_resends: u32,
) -> Result<Vec<Chunk>, ChannelError> {
    let mut chunks = Vec::new();
    for index in 0..count {
        let mut attempts = 0;
        loop {
            match send(channels, source, &Instruction::FetchChunk { export_id, index }) {
                Ok(Response::Chunk(c)) => {
                    chunks.push(c);
                    break;
                }
                Ok(other) => {
                    return Err(ChannelError::Malformed(format!("expected a chunk, got {other:?}")));
                }
                Err(err) if err.is_transient() && attempts < max_resends => attempts += 1,
                Err(err) => return Err(err),
            }
        }
    }
    Ok(chunks)
}

fn pump_chunks(
    channels: &mut Channels,
    destination: InstanceId,
    transfer_id: TransferId,
    platform: &str,
    out: &mut Outgoing,
    per_poll: usize,
    max_resends: u32,
) -> PumpOutcome {
    if !out.begun {
        let begin = Instruction::BeginImport {
            transfer_id,
            platform: platform.to_string(),
            total: out.chunks.len() as u32,
            digest: out.digest,
        };
        match send(channels, destination, &begin) {
            Ok(_) => {
                out.begun = true;
                out.resends = 0;
            }
            Err(err) => return out.retry_or_fail(err, max_resends),
        }
    }
    for _ in 0..per_poll {
        let Some(c) = out.chunks.get(out.next) else {
            return PumpOutcome::Failed(
                FailureKind::ChunkTransport,
                "every chunk pushed but no import was queued".to_string(),
            );
        };
        let push = Instruction::PushChunk {
            platform: platform.to_string(),
            chunk: c.clone(),
        };
        match send(channels, destination, &push) {
            Ok(Response::ImportQueued { job }) => return PumpOutcome::Queued(job),
            Ok(_) => {
                out.next += 1;
                out.resends = 0;
            }
            Err(err) => return out.retry_or_fail(err, max_resends),
        }
    }
    PumpOutcome::Waiting
}

// ===========================================================================
// Controller
// ===========================================================================

pub struct TransferController {
    config: ControllerConfig,
    channels: Channels,
    transfers: BTreeMap<TransferId, Transfer>,
    log: TransactionLog,
    store: SnapshotStore,
    next_transfer: u64,
    next_export: u64,
}

impl std::fmt::Debug for TransferController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferController")
            .field("instances", &self.channels.keys().collect::<Vec<_>>())
            .field("transfers", &self.transfers)
            .finish_non_exhaustive()
    }
}

impl TransferController {
    pub fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        let log = match &config.transaction_log_path {
            Some(path) => TransactionLog::with_file(path)?,
            None => TransactionLog::in_memory(),
        };
        Ok(Self {
            store: SnapshotStore::new(config.snapshot_cache_capacity),
            config,
            channels: BTreeMap::new(),
            transfers: BTreeMap::new(),
            log,
            next_transfer: 0,
            next_export: 0,
        })
    }

    /// Add a process. A second channel for the same instance replaces the
    /// first.
    pub fn register(&mut self, channel: Box<dyn ControlChannel>) -> InstanceId {
        let id = channel.instance();
        tracing::info!(instance = %id, "instance_registered");
        self.channels.insert(id, channel);
        id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn transfer(&self, id: TransferId) -> Option<&TransferRecord> {
        self.transfers.get(&id).map(|t| &t.record)
    }

    pub fn transfers(&self) -> impl Iterator<Item = &TransferRecord> {
        self.transfers.values().map(|t| &t.record)
    }

    /// Whether every transfer has reached a terminal state.
    pub fn is_idle(&self) -> bool {
        self.transfers.values().all(|t| t.record.state.is_terminal())
    }

    // -----------------------------------------------------------------------
    // Starting transfers
    // -----------------------------------------------------------------------

    /// Lock `platform` on `source` and start exporting it towards
    /// `destination`. Lock and export failures end the transfer in
    /// `Failed` and are reported through its record, not as an error.
    pub fn start_transfer(
        &mut self,
        platform: &str,
        source: InstanceId,
        destination: InstanceId,
        now_ms: u64,
    ) -> Result<TransferId, ControllerError> {
        let (id, export_id) = self.open(platform, source, destination, None, now_ms)?;

        let lock = Instruction::Lock {
            platform: platform.to_string(),
        };
        match send(&mut self.channels, source, &lock) {
            Ok(Response::Locked { frozen }) => {
                let detail = format!("{frozen} entities frozen");
                self.advance(id, TransferState::Locked, now_ms, detail)?
            }
            Ok(other) => {
                let detail = format!("unexpected {other:?}");
                self.finish_unsuccessfully(id, FailureKind::Lock, now_ms, detail)?;
                return Ok(id);
            }
            Err(err) => {
                self.finish_unsuccessfully(id, FailureKind::Lock, now_ms, err.to_string())?;
                return Ok(id);
            }
        }

        let start = Instruction::StartExport {
            platform: platform.to_string(),
            export_id,
        };
        match send(&mut self.channels, source, &start) {
            Ok(Response::ExportStarted { job }) => {
                self.advance(id, TransferState::Exporting, now_ms, format!("{export_id} as {job}"))?
            }
            Ok(other) => {
                let detail = format!("unexpected {other:?}");
                self.finish_unsuccessfully(id, FailureKind::Export, now_ms, detail)?
            }
            Err(err) => {
                self.finish_unsuccessfully(id, FailureKind::Export, now_ms, err.to_string())?
            }
        }
        Ok(id)
    }

    fn open(
        &mut self,
        platform: &str,
        source: InstanceId,
        destination: InstanceId,
        export_id: Option<ExportId>,
        now_ms: u64,
    ) -> Result<(TransferId, ExportId), ControllerError> {
        for instance in [source, destination] {
            if !self.channels.contains_key(&instance) {
                return Err(ControllerError::UnknownInstance(instance));
            }
        }
        if source == destination {
            return Err(ControllerError::SameInstance(source));
        }
        if let Some(existing) = self
            .transfers
            .values()
            .find(|t| t.record.platform == platform && !t.record.state.is_terminal())
        {
            return Err(ControllerError::TransferInFlight {
                platform: platform.to_string(),
                transfer: existing.record.id,
            });
        }

        self.next_transfer += 1;
        let id = TransferId(self.next_transfer);
        let export_id = match export_id {
            Some(adopted) => {
                self.next_export = self.next_export.max(adopted.0);
                adopted
            }
            None => {
                self.next_export += 1;
                ExportId(self.next_export)
            }
        };
        let (record, event) =
            TransferRecord::create(id, platform, source, destination, export_id, now_ms);
        self.transfers.insert(
            id,
            Transfer {
                record,
                outgoing: None,
                destination_touched: false,
            },
        );
        self.record_event(event);
        Ok((id, export_id))
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Drain every outbox, push pending chunks and enforce the validation
    /// timeout.
    pub fn poll(&mut self, now_ms: u64) {
        let instances: Vec<InstanceId> = self.channels.keys().copied().collect();
        for instance in instances {
            match send(&mut self.channels, instance, &Instruction::TakeMessages) {
                Ok(Response::Messages(messages)) => {
                    for message in messages {
                        if let Err(err) = self.handle_message(instance, message, now_ms) {
                            tracing::warn!(
                                instance = %instance,
                                error = %err,
                                "message_handling_failed"
                            );
                        }
                    }
                }
                Ok(other) => {
                    tracing::warn!(
                        instance = %instance,
                        response = ?other,
                        "unexpected_poll_response"
                    )
                }
                Err(err) => {
                    tracing::warn!(instance = %instance, error = %err, "message_poll_failed")
                }
            }
        }

        let pushing: Vec<TransferId> = self
            .transfers
            .values()
            .filter(|t| t.outgoing.is_some() && t.record.state == TransferState::Exported)
            .map(|t| t.record.id)
            .collect();
        for id in pushing {
            if let Err(err) = self.pump(id, now_ms) {
                tracing::warn!(transfer = %id, error = %err, "transport_step_failed");
            }
        }

        let timeout = self.config.validation_timeout_ms;
        let overdue: Vec<TransferId> = self
            .transfers
            .values()
            .filter(|t| t.record.validation_overdue(now_ms, timeout))
            .map(|t| t.record.id)
            .collect();
        for id in overdue {
            let detail = format!("no validation report within {timeout} ms");
            let kind = FailureKind::ValidationTimeout;
            if let Err(err) = self.finish_unsuccessfully(id, kind, now_ms, detail) {
                tracing::warn!(transfer = %id, error = %err, "timeout_rollback_failed");
            }
        }
    }

    /// React to one message an instance posted.
    pub fn handle_message(
        &mut self,
        from: InstanceId,
        message: Message,
        now_ms: u64,
    ) -> Result<(), ControllerError> {
        match message {
            Message::RequestTransfer {
                export_id,
                destination,
            } => self.adopt(from, export_id, destination, now_ms),
            Message::PlatformExported {
                export_id,
                chunk_count,
                digest,
                ..
            } => match self.find_by_export(from, export_id) {
                Some(id) => self.on_exported(id, chunk_count, digest, now_ms),
                None => {
                    tracing::debug!(instance = %from, export = %export_id, "unclaimed_export");
                    Ok(())
                }
            },
            Message::ExportFailed {
                export_id, reason, ..
            } => match self.find_by_export(from, export_id) {
                Some(id) => self.finish_unsuccessfully(id, FailureKind::Export, now_ms, reason),
                None => Ok(()),
            },
            Message::ImportFailed {
                transfer_id,
                kind,
                reason,
                ..
            } => {
                if !self.is_destination_of(transfer_id, from) {
                    return Ok(());
                }
                let kind = match kind {
                    ErrorKind::ChunkTimeout => FailureKind::ChunkTimeout,
                    _ => FailureKind::Import,
                };
                self.finish_unsuccessfully(transfer_id, kind, now_ms, reason)
            }
            Message::ValidationReport {
                transfer_id,
                success,
                result,
                losses,
                ..
            } => self.on_validation_report(from, transfer_id, success, result, losses, now_ms),
            Message::RequestDeleteSource { platform } => {
                send(&mut self.channels, from, &Instruction::DeletePlatform { platform })?;
                Ok(())
            }
            Message::RequestUnlockSource { platform } => {
                send(&mut self.channels, from, &Instruction::Unlock { platform })?;
                Ok(())
            }
            Message::StatusUpdate(update) => {
                self.broadcast(&update, Some(from));
                Ok(())
            }
        }
    }

    fn find_by_export(&self, source: InstanceId, export_id: ExportId) -> Option<TransferId> {
        self.transfers
            .values()
            .find(|t| {
                t.record.source == source
                    && t.record.export_id == export_id
                    && !t.record.state.is_terminal()
            })
            .map(|t| t.record.id)
    }

    fn is_destination_of(&self, id: TransferId, instance: InstanceId) -> bool {
        self.transfers
            .get(&id)
            .is_some_and(|t| t.record.destination == instance && !t.record.state.is_terminal())
    }

    /// Take over an export an instance started on its own.
    fn adopt(
        &mut self,
        from: InstanceId,
        export_id: ExportId,
        destination: InstanceId,
        now_ms: u64,
    ) -> Result<(), ControllerError> {
        let Response::Status(status) = send(&mut self.channels, from, &Instruction::Status)? else {
            return Err(ChannelError::Malformed("expected a status".into()).into());
        };
        let Some(export) = status.exports.iter().find(|e| e.export_id == export_id) else {
            tracing::warn!(
                instance = %from,
                export = %export_id,
                "transfer_request_for_unknown_export"
            );
            return Ok(());
        };
        let (id, _) = self.open(&export.platform, from, destination, Some(export_id), now_ms)?;
        self.advance(id, TransferState::Locked, now_ms, "lock held by source")?;
        self.advance(id, TransferState::Exporting, now_ms, "export started by source")?;

        match send(&mut self.channels, from, &Instruction::ExportStatus { export_id })? {
            Response::Export(ExportState::Ready {
                chunk_count, digest, ..
            }) => self.on_exported(id, chunk_count, digest, now_ms),
            Response::Export(ExportState::Failed { reason }) => {
                self.finish_unsuccessfully(id, FailureKind::Export, now_ms, reason)
            }
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    fn on_exported(
        &mut self,
        id: TransferId,
        chunk_count: u32,
        sum: u64,
        now_ms: u64,
    ) -> Result<(), ControllerError> {
        let transfer = self.transfers.get_mut(&id).ok_or(ControllerError::UnknownTransfer(id))?;
        if transfer.record.state != TransferState::Exporting {
            return Ok(());
        }
        transfer.record.chunk_count = chunk_count;
        transfer.record.digest = sum;
        let source = transfer.record.source;
        let export_id = transfer.record.export_id;
        let platform = transfer.record.platform.clone();
        self.advance(
            id,
            TransferState::Exported,
            now_ms,
            format!("{chunk_count} chunks, digest {sum:016x}"),
        )?;

        let chunks = match fetch_chunks(
            &mut self.channels,
            source,
            export_id,
            chunk_count,
            self.config.max_chunk_resends,
        ) {
            Ok(chunks) => chunks,
            Err(err) => {
                let kind = FailureKind::ChunkTransport;
                return self.finish_unsuccessfully(id, kind, now_ms, err.to_string());
            }
        };
        let bytes = match reassemble(&chunks) {
            Ok(bytes) => bytes,
            Err(err) => {
                let kind = FailureKind::ChunkTransport;
                return self.finish_unsuccessfully(id, kind, now_ms, err.to_string());
            }
        };
        let found = digest(&bytes);
        if found != sum {
            let detail = format!("payload digest mismatch: expected {sum:016x}, got {found:016x}");
            return self.finish_unsuccessfully(id, FailureKind::ChunkTransport, now_ms, detail);
        }
        tracing::info!(transfer = %id, export = %export_id, bytes = bytes.len(), "payload_stored");
        self.store.insert(StoredSnapshot {
            export_id,
            platform,
            stored_at_ms: now_ms,
            data: bytes,
        });

        if let Some(transfer) = self.transfers.get_mut(&id) {
            transfer.outgoing = Some(Outgoing {
                chunks,
                digest: sum,
                begun: false,
                next: 0,
                resends: 0,
            });
        }
        Ok(())
    }

    fn pump(&mut self, id: TransferId, now_ms: u64) -> Result<(), ControllerError> {
        let per_poll = self.config.chunks_per_poll.max(1);
        let max_resends = self.config.max_chunk_resends;
        let outcome = {
            let transfer = self.transfers.get_mut(&id).ok_or(ControllerError::UnknownTransfer(id))?;
            let destination = transfer.record.destination;
            let platform = transfer.record.platform.clone();
            let Some(out) = transfer.outgoing.as_mut() else {
                return Ok(());
            };
            let outcome = pump_chunks(
                &mut self.channels,
                destination,
                id,
                &platform,
                out,
                per_poll,
                max_resends,
            );
            let begun = out.begun;
            transfer.destination_touched |= begun;
            outcome
        };
        match outcome {
            PumpOutcome::Waiting => Ok(()),
            PumpOutcome::Queued(job) => {
                if let Some(transfer) = self.transfers.get_mut(&id) {
                    transfer.outgoing = None;
                }
                let detail = format!("import queued as {job}");
                self.advance(id, TransferState::Importing, now_ms, detail)
            }
            PumpOutcome::Failed(kind, detail) => {
                self.finish_unsuccessfully(id, kind, now_ms, detail)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    fn on_validation_report(
        &mut self,
        from: InstanceId,
        id: TransferId,
        success: bool,
        result: ValidationResult,
        losses: LossTally,
        now_ms: u64,
    ) -> Result<(), ControllerError> {
        let Some(transfer) = self.transfers.get_mut(&id) else {
            tracing::debug!(transfer = %id, "report_for_unknown_transfer");
            return Ok(());
        };
        if transfer.record.destination != from
            || transfer.record.state != TransferState::Importing
        {
            tracing::warn!(
                transfer = %id,
                state = %transfer.record.state,
                success,
                "late_validation_report"
            );
            return Ok(());
        }
        let detail = if success {
            format!(
                "{} entities, {} warnings, {}",
                result.entity_count,
                result.metrics.warnings(),
                losses.summary()
            )
        } else {
            result.mismatch_details.clone()
        };
        let event = transfer.record.transition(TransferState::Validating, now_ms, detail.clone())?;
        transfer.record.validation = Some(result);
        transfer.record.losses = Some(losses);
        self.record_event(event);

        if success {
            self.complete(id, now_ms)
        } else {
            self.finish_unsuccessfully(id, FailureKind::Validation, now_ms, detail)
        }
    }

    fn complete(&mut self, id: TransferId, now_ms: u64) -> Result<(), ControllerError> {
        let record = self.record_of(id)?;
        self.advance(id, TransferState::Completed, now_ms, "source deleted")?;
        let delete = Instruction::DeletePlatform {
            platform: record.platform.clone(),
        };
        if let Err(err) = send(&mut self.channels, record.source, &delete) {
            tracing::warn!(transfer = %id, error = %err, "source_delete_failed");
        }
        self.announce(
            &record,
            Severity::Success,
            format!("Platform '{}' transferred to {}", record.platform, record.destination),
        );
        Ok(())
    }

    /// End a transfer in `Failed` (nothing left the source) or
    /// `RolledBack`, undoing whatever this controller did to the source.
    fn finish_unsuccessfully(
        &mut self,
        id: TransferId,
        kind: FailureKind,
        now_ms: u64,
        detail: String,
    ) -> Result<(), ControllerError> {
        let transfer = self.transfers.get_mut(&id).ok_or(ControllerError::UnknownTransfer(id))?;
        let previous = transfer.record.state;
        if previous.is_terminal() {
            return Ok(());
        }
        let target = match previous {
            TransferState::Created | TransferState::Locked | TransferState::Exporting => {
                TransferState::Failed
            }
            _ => TransferState::RolledBack,
        };
        let event = transfer.record.fail(target, kind, now_ms, detail.clone())?;
        transfer.outgoing = None;
        let touched = transfer.destination_touched;
        let record = transfer.record.clone();
        self.record_event(event);

        if previous != TransferState::Created {
            let unlock = Instruction::Unlock {
                platform: record.platform.clone(),
            };
            match send(&mut self.channels, record.source, &unlock) {
                Ok(_) => {
                    tracing::info!(transfer = %id, platform = %record.platform, "source_unlocked")
                }
                Err(err) => tracing::warn!(transfer = %id, error = %err, "source_unlock_failed"),
            }
        }
        if target == TransferState::RolledBack
            && touched
            && self.config.cleanup_destination_on_rollback
        {
            let delete = Instruction::DeletePlatform {
                platform: record.platform.clone(),
            };
            match send(&mut self.channels, record.destination, &delete) {
                Ok(_) => tracing::info!(transfer = %id, "destination_cleaned_up"),
                Err(err) => {
                    tracing::debug!(transfer = %id, error = %err, "destination_cleanup_skipped")
                }
            }
        }

        let (severity, verb) = match target {
            TransferState::Failed => (Severity::Error, "failed"),
            _ => (Severity::Warning, "rolled back"),
        };
        self.announce(
            &record,
            severity,
            format!("Transfer of '{}' {verb} ({kind:?}): {detail}", record.platform),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn record_of(&self, id: TransferId) -> Result<TransferRecord, ControllerError> {
        self.transfers
            .get(&id)
            .map(|t| t.record.clone())
            .ok_or(ControllerError::UnknownTransfer(id))
    }

    fn advance(
        &mut self,
        id: TransferId,
        to: TransferState,
        now_ms: u64,
        detail: impl Into<String>,
    ) -> Result<(), ControllerError> {
        let transfer = self.transfers.get_mut(&id).ok_or(ControllerError::UnknownTransfer(id))?;
        let event = transfer.record.transition(to, now_ms, detail)?;
        self.record_event(event);
        Ok(())
    }

    fn record_event(&mut self, event: TransactionEvent) {
        tracing::info!(
            transfer = %event.transfer_id,
            platform = %event.platform,
            state = %event.state,
            elapsed_ms = event.elapsed_ms,
            delta_ms = event.delta_ms,
            failure = ?event.failure,
            detail = %event.detail,
            "transfer_state"
        );
        // The in-memory copy is kept even when the file write fails.
        if let Err(err) = self.log.append(event) {
            tracing::warn!(error = %err, "transaction_log_write_failed");
        }
    }

    /// Tell both sides of a transfer.
    fn announce(&mut self, record: &TransferRecord, severity: Severity, message: String) {
        for instance in [record.source, record.destination] {
            let announce = Instruction::Announce {
                message: message.clone(),
                severity,
            };
            if let Err(err) = send(&mut self.channels, instance, &announce) {
                tracing::warn!(instance = %instance, error = %err, "announce_failed");
            }
        }
    }

    fn broadcast(&mut self, update: &StatusUpdate, except: Option<InstanceId>) {
        let targets: Vec<InstanceId> = self
            .channels
            .keys()
            .copied()
            .filter(|i| Some(*i) != except)
            .collect();
        for instance in targets {
            let announce = Instruction::Announce {
                message: update.message.clone(),
                severity: update.severity,
            };
            if let Err(err) = send(&mut self.channels, instance, &announce) {
                tracing::warn!(instance = %instance, error = %err, "broadcast_failed");
            }
        }
    }
}
