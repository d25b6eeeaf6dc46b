//! Export job: scans a (normally locked) platform a batch of entities per
//! tick and, once the cursor reaches the end, assembles a
//! [`PlatformSnapshot`] whose verification totals have been checked
//! against an independent live measurement.

use std::collections::BTreeMap;

use crate::fixed::Ticks;
use crate::id::{EntityHandle, ExportId, StableId, SurfaceId};
use crate::job::{Job, JobContext, JobKind, JobOutput, JobProgress, JobStatus};
use crate::lock::LockRecord;
use crate::model::{
    EntityRecord, PlatformMeta, PlatformSnapshot, SCHEMA_VERSION, VerificationTotals,
};
use crate::scanner::{finalize_records, live_totals, scan_entity, scan_ground_items, stable_id};
use crate::world::World;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    #[error("platform '{0}' not found")]
    PlatformNotFound(String),
    #[error("surface of platform '{0}' became invalid during export")]
    SurfaceInvalid(String),
    #[error("export totals inconsistent: {}", details.join("; "))]
    ConsistencyFailure { details: Vec<String> },
}

#[derive(Debug)]
pub struct ExportJob {
    export_id: ExportId,
    platform: String,
    surface: SurfaceId,
    meta: PlatformMeta,
    frozen_states: BTreeMap<StableId, bool>,
    started_at: Ticks,
    handles: Vec<EntityHandle>,
    cursor: usize,
    records: Vec<EntityRecord>,
    failure: Option<ExportError>,
}

impl ExportJob {
    /// Capture the work list. When the platform is locked, metadata and
    /// active flags come from the lock record, since the lock itself has
    /// cleared the schedule and frozen the entities.
    pub fn start(
        world: &dyn World,
        export_id: ExportId,
        platform: &str,
        lock: Option<&LockRecord>,
    ) -> Result<Self, ExportError> {
        let info = world
            .platform(platform)
            .ok_or_else(|| ExportError::PlatformNotFound(platform.to_string()))?;
        let handles = world.entities(info.surface);

        let (schedule, paused, frozen_states) = match lock {
            Some(record) => (
                record.original_schedule.clone(),
                record.was_paused,
                record.frozen_states.clone(),
            ),
            None => {
                let frozen = handles
                    .iter()
                    .filter_map(|&h| world.entity(h))
                    .filter(|view| view.category.is_freezable())
                    .map(|view| (stable_id(&view), view.active))
                    .collect();
                (info.schedule.clone(), info.paused, frozen)
            }
        };

        tracing::info!(platform, export = %export_id, entities = handles.len(), "export_started");
        Ok(Self {
            export_id,
            platform: platform.to_string(),
            surface: info.surface,
            meta: PlatformMeta {
                name: info.name,
                force: info.force,
                schedule,
                paused,
            },
            frozen_states,
            started_at: world.current_tick(),
            records: Vec::with_capacity(handles.len()),
            handles,
            cursor: 0,
            failure: None,
        })
    }

    pub fn export_id(&self) -> ExportId {
        self.export_id
    }

    fn build_snapshot(&mut self, world: &dyn World) -> Result<PlatformSnapshot, ExportError> {
        let mut tiles = world.tiles(self.surface);
        tiles.sort();
        let ground = scan_ground_items(world, self.surface);
        let entities = finalize_records(std::mem::take(&mut self.records), ground);

        let totals = VerificationTotals::from_records(&entities, tiles.len());
        let live = live_totals(world, self.surface);
        let details = totals.differences(&live);
        if !details.is_empty() {
            tracing::warn!(
                platform = %self.platform,
                mismatches = details.len(),
                "export_consistency_failure"
            );
            return Err(ExportError::ConsistencyFailure { details });
        }

        Ok(PlatformSnapshot {
            schema_version: SCHEMA_VERSION,
            source_version: world.game_version(),
            captured_at: self.started_at,
            platform: self.meta.clone(),
            entities,
            tiles,
            frozen_states: std::mem::take(&mut self.frozen_states),
            totals,
        })
    }
}

impl Job for ExportJob {
    fn kind(&self) -> JobKind {
        JobKind::Export
    }

    fn platform(&self) -> &str {
        &self.platform
    }

    fn total_work(&self) -> usize {
        self.handles.len()
    }

    fn progress(&self) -> JobProgress {
        JobProgress {
            phase: "scanning".to_string(),
            done: self.cursor,
            total: self.handles.len(),
        }
    }

    fn step(&mut self, ctx: &mut JobContext<'_>, budget: usize) -> JobStatus {
        if !ctx.world.surface_valid(self.surface) {
            self.failure = Some(ExportError::SurfaceInvalid(self.platform.clone()));
            return JobStatus::Done;
        }
        let end = (self.cursor + budget).min(self.handles.len());
        for &handle in &self.handles[self.cursor..end] {
            if let Some(record) = scan_entity(&*ctx.world, ctx.categories, handle) {
                self.records.push(record);
            }
        }
        self.cursor = end;
        if self.cursor >= self.handles.len() {
            JobStatus::Done
        } else {
            JobStatus::Pending
        }
    }

    fn finish(mut self: Box<Self>, ctx: &mut JobContext<'_>) -> JobOutput {
        let result = match self.failure.take() {
            Some(err) => Err(err),
            None => self.build_snapshot(&*ctx.world),
        };
        match &result {
            Ok(snapshot) => tracing::info!(
                platform = %self.platform,
                entities = snapshot.entities.len(),
                items = snapshot.totals.total_items(),
                "export_complete"
            ),
            Err(err) => tracing::warn!(platform = %self.platform, error = %err, "export_failed"),
        }
        JobOutput::Export {
            export_id: self.export_id,
            platform: self.platform.clone(),
            result,
        }
    }
}
