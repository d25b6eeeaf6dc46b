//! One transfer-capable simulation process.
//!
//! [`Instance`] is what sits at the far end of a control channel: it owns
//! the world, the process-wide [`ProcessRegistry`] and the configuration,
//! turns [`Instruction`]s into [`Response`]s, and advances jobs once per
//! simulation tick via [`Instance::on_tick`].

use crate::category::CategoryRegistry;
use crate::codec::{chunk, decode, encode};
use crate::config::TransferConfig;
use crate::export::ExportJob;
use crate::fixed::Ticks;
use crate::id::{ExportId, InstanceId, TransferId, digest};
use crate::import::{ImportJob, ImportReport, ImportError};
use crate::job::{JobContext, JobOutput};
use crate::lock::LockError;
use crate::model::PlatformSnapshot;
use crate::protocol::{
    ErrorKind, ExportState, Instruction, Message, RemoteError, Response, Severity, StatusUpdate,
};
use crate::reassembly::ReassemblyError;
use crate::registry::{ExportArtifact, ExportEntry, ProcessRegistry};
use crate::scanner::live_totals;
use crate::validation::validate;
use crate::world::World;

pub struct Instance<W: World> {
    id: InstanceId,
    world: W,
    categories: CategoryRegistry,
    registry: ProcessRegistry,
    config: TransferConfig,
}

impl<W: World> std::fmt::Debug for Instance<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn lock_error(err: LockError) -> Response {
    let kind = match err {
        LockError::PlatformNotFound(_) => ErrorKind::NotFound,
        _ => ErrorKind::Lock,
    };
    Response::Error(RemoteError::new(kind, err))
}

fn reassembly_error(err: ReassemblyError) -> Response {
    let kind = match err {
        ReassemblyError::ChunkTimeout(_) => ErrorKind::ChunkTimeout,
        _ => ErrorKind::Reassembly,
    };
    Response::Error(RemoteError::new(kind, err))
}

impl<W: World> Instance<W> {
    pub fn new(id: InstanceId, world: W, config: TransferConfig) -> Self {
        Self {
            id,
            world,
            categories: CategoryRegistry::default(),
            registry: ProcessRegistry::new(&config),
            config,
        }
    }

    /// Replace the category handlers.
    pub fn with_categories(mut self, categories: CategoryRegistry) -> Self {
        self.categories = categories;
        self
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Control channel
    // -----------------------------------------------------------------------

    /// Control-channel endpoint: JSON instruction in, JSON response out.
    pub fn execute(&mut self, text: &str) -> String {
        let response = match serde_json::from_str::<Instruction>(text) {
            Ok(instruction) => self.handle(instruction),
            Err(err) => Response::Error(RemoteError::new(ErrorKind::BadInstruction, err)),
        };
        serde_json::to_string(&response).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "response_encoding_failed");
            r#"{"Error":{"kind":"BadInstruction","message":"response encoding failed"}}"#
                .to_string()
        })
    }

    pub fn handle(&mut self, instruction: Instruction) -> Response {
        match instruction {
            Instruction::Lock { platform } => {
                match self.registry.locks.lock(&mut self.world, &platform, &self.config.lock) {
                    Ok(record) => Response::Locked {
                        frozen: record.frozen_states.len(),
                    },
                    Err(err) => lock_error(err),
                }
            }
            Instruction::Unlock { platform } => {
                match self.registry.locks.unlock(&mut self.world, &platform) {
                    Ok(outcome) => {
                        self.release_exports(&platform);
                        Response::Unlocked {
                            restored: outcome.restored,
                            platform_present: outcome.platform_present,
                        }
                    }
                    Err(err) => lock_error(err),
                }
            }
            Instruction::StartExport {
                platform,
                export_id,
            } => self.start_export(&platform, export_id),
            Instruction::ExportStatus { export_id } => {
                Response::Export(self.export_state(export_id))
            }
            Instruction::FetchChunk { export_id, index } => {
                match self.registry.exports.get(&export_id) {
                    Some(ExportEntry::Ready(artifact)) => {
                        match artifact.chunks.get(index as usize) {
                            Some(c) => Response::Chunk(c.clone()),
                            None => Response::Error(RemoteError::new(
                                ErrorKind::NotFound,
                                format!("{export_id} has no chunk {index}"),
                            )),
                        }
                    }
                    _ => Response::Error(RemoteError::new(
                        ErrorKind::NotFound,
                        format!("{export_id} is not ready"),
                    )),
                }
            }
            Instruction::BeginImport {
                transfer_id,
                platform,
                total,
                digest,
            } => {
                if self.world.platform(&platform).is_some() {
                    return Response::Error(RemoteError::new(
                        ErrorKind::Import,
                        ImportError::PlatformExists(platform),
                    ));
                }
                let now = self.world.current_tick();
                self.registry.reassembly.begin(&platform, transfer_id, total, digest, now);
                Response::Ok
            }
            Instruction::PushChunk { platform, chunk } => self.push_chunk(&platform, chunk),
            Instruction::TakeMessages => Response::Messages(self.registry.take_messages()),
            Instruction::DeletePlatform { platform } => {
                match self.world.delete_platform(&platform) {
                    Ok(()) => {
                        self.release_exports(&platform);
                        self.registry.locks.discard(&platform);
                        tracing::info!(platform = %platform, "platform_deleted");
                        Response::Ok
                    }
                    Err(err) => Response::Error(RemoteError::new(ErrorKind::World, err)),
                }
            }
            Instruction::Announce { message, severity } => {
                self.announce(StatusUpdate { message, severity });
                Response::Ok
            }
            Instruction::SetBudget {
                export_batch_size,
                import_batch_size,
                sync_mode,
            } => {
                let mut scheduler = self.config.scheduler;
                if let Some(n) = export_batch_size {
                    scheduler.export_batch_size = n;
                }
                if let Some(n) = import_batch_size {
                    scheduler.import_batch_size = n;
                }
                if let Some(sync) = sync_mode {
                    scheduler.sync_mode = sync;
                }
                self.config.scheduler = scheduler;
                self.registry.scheduler.set_config(scheduler);
                Response::Ok
            }
            Instruction::Status => {
                Response::Status(self.registry.status(self.id, self.world.current_tick()))
            }
        }
    }

    fn release_exports(&mut self, platform: &str) {
        let released = self.registry.release_exports(platform);
        if released > 0 {
            tracing::debug!(platform, released, "exports_released");
        }
    }

    fn announce(&mut self, update: StatusUpdate) {
        tracing::info!(
            instance = %self.id,
            severity = ?update.severity,
            message = %update.message,
            "announcement"
        );
        self.registry.announcements.push(update);
    }

    fn start_export(&mut self, platform: &str, export_id: ExportId) -> Response {
        if self.registry.exports.contains_key(&export_id) {
            return Response::Error(RemoteError::new(
                ErrorKind::BadInstruction,
                format!("{export_id} already exists"),
            ));
        }
        let Some(lock) = self.registry.locks.get(platform) else {
            return lock_error(LockError::NotLocked(platform.to_string()));
        };
        if self.registry.scheduler.has_job_for(platform) {
            return Response::Error(RemoteError::new(
                ErrorKind::Export,
                format!("platform '{platform}' already has a job in flight"),
            ));
        }
        match ExportJob::start(&self.world, export_id, platform, Some(lock)) {
            Ok(job) => {
                let job = self.registry.scheduler.enqueue(Box::new(job));
                self.registry.exports.insert(
                    export_id,
                    ExportEntry::Running {
                        job,
                        platform: platform.to_string(),
                    },
                );
                Response::ExportStarted { job }
            }
            Err(err) => Response::Error(RemoteError::new(ErrorKind::Export, err)),
        }
    }

    fn export_state(&self, export_id: ExportId) -> ExportState {
        match self.registry.exports.get(&export_id) {
            Some(ExportEntry::Running { job, .. }) => ExportState::Running {
                progress: self
                    .registry
                    .scheduler
                    .active()
                    .into_iter()
                    .find(|s| s.job == *job)
                    .map(|s| s.progress),
            },
            Some(ExportEntry::Ready(artifact)) => ExportState::Ready {
                platform: artifact.platform.clone(),
                chunk_count: artifact.chunks.len() as u32,
                digest: artifact.digest,
                bytes: artifact.bytes,
            },
            Some(ExportEntry::Failed { reason, .. }) => ExportState::Failed {
                reason: reason.clone(),
            },
            None => ExportState::Unknown,
        }
    }

    fn push_chunk(&mut self, platform: &str, c: crate::codec::Chunk) -> Response {
        let now = self.world.current_tick();
        let (received, total) = match self.registry.reassembly.accept(platform, c, now) {
            Ok(progress) => progress,
            Err(err) => return reassembly_error(err),
        };
        if received < total {
            return Response::ChunkAccepted { received, total };
        }
        let (transfer_id, bytes) = match self.registry.reassembly.take_complete(platform) {
            Ok(done) => done,
            Err(err) => return reassembly_error(err),
        };
        let snapshot = match decode(&bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => return Response::Error(RemoteError::new(ErrorKind::Decode, err)),
        };
        self.queue_import(transfer_id, platform, snapshot)
    }

    fn queue_import(
        &mut self,
        transfer_id: TransferId,
        platform: &str,
        snapshot: PlatformSnapshot,
    ) -> Response {
        let surface = match self.world.create_platform(platform, &snapshot.platform.force) {
            Ok(surface) => surface,
            Err(err) => return Response::Error(RemoteError::new(ErrorKind::Import, err)),
        };
        // Parked until the pipeline's activation phase sets the real flag.
        if let Err(err) = self.world.set_platform_paused(platform, true) {
            tracing::warn!(platform, error = %err, "import_pause_failed");
        }
        let job = ImportJob::new(transfer_id, platform, surface, snapshot, true);
        let job = self.registry.scheduler.enqueue(Box::new(job));
        tracing::info!(platform, transfer = %transfer_id, "import_queued");
        Response::ImportQueued { job }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance jobs by one scheduler tick and handle whatever completed.
    pub fn on_tick(&mut self) {
        let completions = {
            let mut ctx = JobContext {
                world: &mut self.world,
                categories: &self.categories,
            };
            self.registry.scheduler.tick(&mut ctx)
        };
        for completion in completions {
            match completion.output {
                JobOutput::Export {
                    export_id,
                    platform,
                    result,
                } => self.finish_export(export_id, platform, result),
                JobOutput::Import {
                    transfer_id,
                    platform,
                    result,
                } => self.finish_import(transfer_id, platform, result),
            }
        }
        let now = self.world.current_tick();
        for (platform, transfer_id) in self.registry.reassembly.expire(now) {
            self.registry.post(Message::ImportFailed {
                transfer_id,
                kind: ErrorKind::ChunkTimeout,
                reason: ReassemblyError::ChunkTimeout(platform.clone()).to_string(),
                platform,
            });
        }
    }

    fn finish_export(
        &mut self,
        export_id: ExportId,
        platform: String,
        result: Result<PlatformSnapshot, crate::export::ExportError>,
    ) {
        // Released while running: the transfer it belonged to is over.
        if !matches!(self.registry.exports.get(&export_id), Some(ExportEntry::Running { .. })) {
            tracing::info!(platform = %platform, export = %export_id, "export_discarded");
            return;
        }
        let transport = &self.config.transport;
        let encoded = result
            .map_err(|e| e.to_string())
            .and_then(|snapshot| encode(&snapshot, transport).map_err(|e| e.to_string()));
        match encoded {
            Ok(bytes) => {
                let chunks = chunk(&bytes, self.config.transport.chunk_size);
                let artifact = ExportArtifact {
                    platform: platform.clone(),
                    digest: digest(&bytes),
                    bytes: bytes.len(),
                    created_at: self.world.current_tick(),
                    chunks,
                };
                self.registry.post(Message::PlatformExported {
                    platform,
                    instance: self.id,
                    export_id,
                    chunk_count: artifact.chunks.len() as u32,
                    digest: artifact.digest,
                    timestamp: artifact.created_at,
                });
                self.registry.exports.insert(export_id, ExportEntry::Ready(artifact));
            }
            Err(reason) => {
                self.registry.post(Message::ExportFailed {
                    platform: platform.clone(),
                    export_id,
                    reason: reason.clone(),
                });
                self.registry
                    .exports
                    .insert(export_id, ExportEntry::Failed { platform, reason });
            }
        }
    }

    fn finish_import(
        &mut self,
        transfer_id: TransferId,
        platform: String,
        result: Result<ImportReport, ImportError>,
    ) {
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                self.registry.post(Message::ImportFailed {
                    transfer_id,
                    platform,
                    kind: ErrorKind::Import,
                    reason: err.to_string(),
                });
                return;
            }
        };
        let actual = match self.world.platform(&platform) {
            Some(info) => live_totals(&self.world, info.surface),
            None => Default::default(),
        };
        let result = validate(&report.expected, &actual, &self.config.tolerance);
        if !report.losses.is_empty() {
            let update = StatusUpdate {
                message: format!("Transfer of '{platform}' lost: {}", report.losses.summary()),
                severity: Severity::Warning,
            };
            self.announce(update.clone());
            self.registry.post(Message::StatusUpdate(update));
        }
        self.registry.post(Message::ValidationReport {
            transfer_id,
            platform,
            success: result.success(),
            result,
            losses: report.losses,
        });
    }

    /// Current simulation tick of the owned world.
    pub fn tick(&self) -> Ticks {
        self.world.current_tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    fn instance(id: u32) -> Instance<MemoryWorld> {
        Instance::new(InstanceId(id), MemoryWorld::new(), TransferConfig::default())
    }

    fn ok(instance: &mut Instance<MemoryWorld>, instruction: Instruction) -> Response {
        instance.handle(instruction).into_result().unwrap()
    }

    // -----------------------------------------------------------------------
    // Test 1: JSON in, JSON out
    // -----------------------------------------------------------------------
    #[test]
    fn execute_speaks_json() {
        let mut a = instance(1);
        build_storage_platform(a.world_mut(), "alpha", 2, 10);
        let out = a.execute(r#"{"Lock":{"platform":"alpha"}}"#);
        let response: Response = serde_json::from_str(&out).unwrap();
        assert!(matches!(response, Response::Locked { .. }));

        let garbage: Response = serde_json::from_str(&a.execute("not json")).unwrap();
        assert!(matches!(
            garbage,
            Response::Error(RemoteError {
                kind: ErrorKind::BadInstruction,
                ..
            })
        ));
    }

    // -----------------------------------------------------------------------
    // Test 2: export requires a lock and produces chunks
    // -----------------------------------------------------------------------
    #[test]
    fn export_lifecycle() {
        let mut a = instance(1);
        build_storage_platform(a.world_mut(), "alpha", 30, 600);
        let refused = a.handle(Instruction::StartExport {
            platform: "alpha".into(),
            export_id: ExportId(1),
        });
        assert!(matches!(refused, Response::Error(RemoteError { kind: ErrorKind::Lock, .. })));

        ok(&mut a, Instruction::Lock { platform: "alpha".into() });
        ok(&mut a, Instruction::StartExport {
            platform: "alpha".into(),
            export_id: ExportId(1),
        });
        tick_until_idle(&mut a);

        match ok(&mut a, Instruction::ExportStatus { export_id: ExportId(1) }) {
            Response::Export(ExportState::Ready { chunk_count, .. }) => assert!(chunk_count >= 1),
            other => panic!("unexpected {other:?}"),
        }
        match ok(&mut a, Instruction::TakeMessages) {
            Response::Messages(messages) => {
                assert!(matches!(messages[0], Message::PlatformExported { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ok(&mut a, Instruction::FetchChunk { export_id: ExportId(1), index: 0 }),
            Response::Chunk(_)
        ));
    }

    // -----------------------------------------------------------------------
    // Test 3: chunks pushed to a second instance rebuild and validate
    // -----------------------------------------------------------------------
    #[test]
    fn push_chunks_imports_and_reports() {
        let mut a = instance(1);
        build_mixed_platform(a.world_mut(), "alpha");
        ok(&mut a, Instruction::Lock { platform: "alpha".into() });
        ok(&mut a, Instruction::StartExport {
            platform: "alpha".into(),
            export_id: ExportId(1),
        });
        tick_until_idle(&mut a);
        let status = ok(&mut a, Instruction::ExportStatus { export_id: ExportId(1) });
        let (count, sum) = match status {
            Response::Export(ExportState::Ready {
                chunk_count,
                digest,
                ..
            }) => (chunk_count, digest),
            other => panic!("unexpected {other:?}"),
        };

        let mut b = instance(2);
        ok(&mut b, Instruction::BeginImport {
            transfer_id: TransferId(9),
            platform: "alpha".into(),
            total: count,
            digest: sum,
        });
        let mut last = Response::Ok;
        for index in 0..count {
            let fetch = Instruction::FetchChunk {
                export_id: ExportId(1),
                index,
            };
            let Response::Chunk(c) = ok(&mut a, fetch) else {
                panic!("no chunk");
            };
            last = ok(&mut b, Instruction::PushChunk {
                platform: "alpha".into(),
                chunk: c,
            });
        }
        assert!(matches!(last, Response::ImportQueued { .. }));
        tick_until_idle(&mut b);

        let Response::Messages(messages) = ok(&mut b, Instruction::TakeMessages) else {
            panic!("no messages");
        };
        let report = messages
            .iter()
            .find_map(|m| match m {
                Message::ValidationReport {
                    success,
                    losses,
                    transfer_id,
                    ..
                } => Some((*success, losses.clone(), *transfer_id)),
                _ => None,
            })
            .unwrap();
        assert!(report.0);
        assert!(report.1.is_empty());
        assert_eq!(report.2, TransferId(9));
    }

    // -----------------------------------------------------------------------
    // Test 4: importing onto an existing name is refused up front
    // -----------------------------------------------------------------------
    #[test]
    fn begin_import_rejects_existing_platform() {
        let mut b = instance(2);
        build_storage_platform(b.world_mut(), "alpha", 1, 1);
        let r = b.handle(Instruction::BeginImport {
            transfer_id: TransferId(1),
            platform: "alpha".into(),
            total: 1,
            digest: 0,
        });
        assert!(matches!(r, Response::Error(RemoteError { kind: ErrorKind::Import, .. })));
    }

    // -----------------------------------------------------------------------
    // Test 5: runtime budget change and status
    // -----------------------------------------------------------------------
    #[test]
    fn set_budget_and_status() {
        let mut a = instance(1);
        build_storage_platform(a.world_mut(), "alpha", 10, 10);
        ok(&mut a, Instruction::SetBudget {
            export_batch_size: Some(3),
            import_batch_size: None,
            sync_mode: None,
        });
        assert_eq!(a.config().scheduler.export_batch_size, 3);
        ok(&mut a, Instruction::Lock { platform: "alpha".into() });
        ok(&mut a, Instruction::StartExport {
            platform: "alpha".into(),
            export_id: ExportId(4),
        });
        a.on_tick();
        let Response::Status(status) = ok(&mut a, Instruction::Status) else {
            panic!("no status");
        };
        assert_eq!(status.locked, vec!["alpha".to_string()]);
        assert_eq!(status.jobs.len(), 1);
        assert_eq!(status.jobs[0].progress.done, 3);
    }

    // -----------------------------------------------------------------------
    // Test 6: delete drops any lock and announce records the message
    // -----------------------------------------------------------------------
    #[test]
    fn delete_and_announce() {
        let mut a = instance(1);
        build_storage_platform(a.world_mut(), "alpha", 1, 1);
        ok(&mut a, Instruction::Lock { platform: "alpha".into() });
        ok(&mut a, Instruction::DeletePlatform { platform: "alpha".into() });
        assert!(!a.registry().locks.is_locked("alpha"));
        assert!(a.world().platform("alpha").is_none());

        ok(&mut a, Instruction::Announce {
            message: "done".into(),
            severity: Severity::Success,
        });
        assert_eq!(a.registry().announcements.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Test 7: an idle reassembly session expires and is reported
    // -----------------------------------------------------------------------
    #[test]
    fn idle_session_expires() {
        let mut b = instance(2);
        ok(&mut b, Instruction::BeginImport {
            transfer_id: TransferId(3),
            platform: "alpha".into(),
            total: 2,
            digest: 0,
        });
        ok(&mut b, Instruction::PushChunk {
            platform: "alpha".into(),
            chunk: crate::codec::Chunk {
                index: 0,
                total: 2,
                payload: vec![1, 2],
            },
        });
        let timeout = b.config().transport.chunk_timeout_ticks;
        b.world_mut().advance(timeout + 1);
        b.on_tick();

        let Response::Messages(messages) = ok(&mut b, Instruction::TakeMessages) else {
            panic!("no messages");
        };
        assert!(matches!(
            messages.as_slice(),
            [Message::ImportFailed {
                transfer_id: TransferId(3),
                kind: ErrorKind::ChunkTimeout,
                ..
            }]
        ));
        let late = b.handle(Instruction::PushChunk {
            platform: "alpha".into(),
            chunk: crate::codec::Chunk {
                index: 1,
                total: 2,
                payload: vec![3],
            },
        });
        assert!(matches!(late, Response::Error(RemoteError { kind: ErrorKind::ChunkTimeout, .. })));
    }

    // -----------------------------------------------------------------------
    // Test 8: unlock and delete release the platform's exports
    // -----------------------------------------------------------------------
    #[test]
    fn exports_released_with_platform() {
        let mut a = instance(1);
        build_storage_platform(a.world_mut(), "alpha", 5, 50);
        build_storage_platform(a.world_mut(), "beta", 5, 50);
        for (platform, id) in [("alpha", 1), ("beta", 2)] {
            ok(&mut a, Instruction::Lock { platform: platform.into() });
            ok(&mut a, Instruction::StartExport {
                platform: platform.into(),
                export_id: ExportId(id),
            });
        }
        tick_until_idle(&mut a);
        assert_eq!(a.registry().exports.len(), 2);

        ok(&mut a, Instruction::Unlock { platform: "alpha".into() });
        assert!(!a.registry().exports.contains_key(&ExportId(1)));
        assert!(a.registry().exports.contains_key(&ExportId(2)));

        ok(&mut a, Instruction::DeletePlatform { platform: "beta".into() });
        assert!(a.registry().exports.is_empty());
        assert!(matches!(
            ok(&mut a, Instruction::ExportStatus { export_id: ExportId(2) }),
            Response::Export(ExportState::Unknown)
        ));
    }

    // -----------------------------------------------------------------------
    // Test 9: an export released while running is discarded on completion
    // -----------------------------------------------------------------------
    #[test]
    fn released_running_export_is_discarded() {
        let mut a = instance(1);
        build_storage_platform(a.world_mut(), "alpha", 30, 300);
        ok(&mut a, Instruction::Lock { platform: "alpha".into() });
        ok(&mut a, Instruction::StartExport {
            platform: "alpha".into(),
            export_id: ExportId(1),
        });
        ok(&mut a, Instruction::Unlock { platform: "alpha".into() });
        tick_until_idle(&mut a);

        assert!(a.registry().exports.is_empty());
        let Response::Messages(messages) = ok(&mut a, Instruction::TakeMessages) else {
            panic!("no messages");
        };
        assert!(!messages.iter().any(|m| matches!(m, Message::PlatformExported { .. })));
    }
}
