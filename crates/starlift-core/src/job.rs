//! Cooperative, tick-bounded job scheduler.
//!
//! Long operations (scanning thousands of entities, rebuilding them) are
//! resumable jobs that carry their own cursor. Every simulation tick the
//! [`Scheduler`] calls each active job's [`Job::step`] with a bounded work
//! budget; a job that reports [`JobStatus::Done`] is removed and its
//! [`Job::finish`] output is handed back to the caller. Nothing blocks.
//!
//! Budgets live in [`SchedulerConfig`] and may be changed between ticks
//! without disturbing jobs already in flight.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::category::CategoryRegistry;
use crate::export::ExportError;
use crate::id::{ExportId, JobId, TransferId};
use crate::import::{ImportError, ImportReport};
use crate::model::PlatformSnapshot;
use crate::world::World;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Entities scanned per export job per tick.
    pub export_batch_size: usize,
    /// Work units (entity creations, state restores, ...) per import job
    /// per tick.
    pub import_batch_size: usize,
    /// Debug mode: every job runs to completion in a single tick.
    pub sync_mode: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            export_batch_size: 50,
            import_batch_size: 50,
            sync_mode: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Job interface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Export,
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Done,
}

/// Snapshot of a job's progress for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub phase: String,
    pub done: usize,
    pub total: usize,
}

/// What a job gets to work with during one step.
pub struct JobContext<'a> {
    pub world: &'a mut dyn World,
    pub categories: &'a CategoryRegistry,
}

/// Result handed back when a job completes.
#[derive(Debug)]
pub enum JobOutput {
    Export {
        export_id: ExportId,
        platform: String,
        result: Result<PlatformSnapshot, ExportError>,
    },
    Import {
        transfer_id: TransferId,
        platform: String,
        result: Result<ImportReport, ImportError>,
    },
}

/// A resumable unit of work.
pub trait Job: std::fmt::Debug {
    fn kind(&self) -> JobKind;

    fn platform(&self) -> &str;

    /// Size of the whole job in work units. Used as the budget in sync mode.
    fn total_work(&self) -> usize;

    fn progress(&self) -> JobProgress;

    /// Do at most `budget` units of work.
    fn step(&mut self, ctx: &mut JobContext<'_>, budget: usize) -> JobStatus;

    /// Consume the job once it reported `Done`.
    fn finish(self: Box<Self>, ctx: &mut JobContext<'_>) -> JobOutput;
}

/// A job that finished during a tick.
#[derive(Debug)]
pub struct Completion {
    pub job: JobId,
    pub output: JobOutput,
}

/// Status line for one active job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job: JobId,
    pub kind: JobKind,
    pub platform: String,
    pub progress: JobProgress,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
    next_id: u64,
    jobs: BTreeMap<JobId, Box<dyn Job>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            next_id: 1,
            jobs: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Replace the budgets. Takes effect on the next tick.
    pub fn set_config(&mut self, config: SchedulerConfig) {
        tracing::info!(
            export_batch_size = config.export_batch_size,
            import_batch_size = config.import_batch_size,
            sync_mode = config.sync_mode,
            "scheduler_budget_changed"
        );
        self.config = config;
    }

    pub fn enqueue(&mut self, job: Box<dyn Job>) -> JobId {
        let id = JobId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        tracing::info!(
            job = %id,
            kind = ?job.kind(),
            platform = job.platform(),
            work = job.total_work(),
            "job_enqueued"
        );
        self.jobs.insert(id, job);
        id
    }

    /// Advance every active job once, in id order. Returns the jobs that
    /// completed during this tick.
    pub fn tick(&mut self, ctx: &mut JobContext<'_>) -> Vec<Completion> {
        let ids: Vec<JobId> = self.jobs.keys().copied().collect();
        let mut completions = Vec::new();
        for id in ids {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            let budget = if self.config.sync_mode {
                job.total_work().max(1)
            } else {
                match job.kind() {
                    JobKind::Export => self.config.export_batch_size.max(1),
                    JobKind::Import => self.config.import_batch_size.max(1),
                }
            };
            if job.step(ctx, budget) == JobStatus::Done {
                if let Some(job) = self.jobs.remove(&id) {
                    tracing::info!(
                        job = %id,
                        kind = ?job.kind(),
                        platform = job.platform(),
                        "job_completed"
                    );
                    completions.push(Completion {
                        job: id,
                        output: job.finish(ctx),
                    });
                }
            }
        }
        completions
    }

    /// Whether any job is working on `platform`.
    pub fn has_job_for(&self, platform: &str) -> bool {
        self.jobs.values().any(|job| job.platform() == platform)
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn active(&self) -> Vec<JobSummary> {
        self.jobs
            .iter()
            .map(|(id, job)| JobSummary {
                job: *id,
                kind: job.kind(),
                platform: job.platform().to_string(),
                progress: job.progress(),
            })
            .collect()
    }
}
