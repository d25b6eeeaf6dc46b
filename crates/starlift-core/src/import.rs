//! Import job: the seven-phase reconstruction pipeline.
//!
//! Each phase completes fully before the next begins:
//!
//! 1. **Tiles** -- place every tile so entities have ground to stand on.
//! 2. **Hub mapping** -- register the platform's auto-created hub under its
//!    original stable id.
//! 3. **Entities** (batched) -- create, deactivate, register, fill
//!    inventories, restore category data.
//! 4. **Fluids** -- one write per source segment, see [`crate::fluid`].
//! 5. **Belts** (single tick) -- exact-slot lane contents and ground items,
//!    see [`crate::belt`].
//! 6. **State** (batched) -- control behaviour, filters, requests, tags,
//!    wires.
//! 7. **Activation** (batched) -- wake freezable entities with the active
//!    flag they had before the source was locked.
//!
//! Per-entity, per-item and per-fluid failures are tallied in a
//! [`LossTally`] and the pipeline keeps going. Only structural failures
//! (the target surface vanished, the hub is missing) abort it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::belt::restore_belts;
use crate::category::EntityCategory;
use crate::fluid::restore_fluids;
use crate::id::{EntityHandle, StableId, SurfaceId, TransferId};
use crate::job::{Job, JobContext, JobKind, JobOutput, JobProgress, JobStatus};
use crate::loss::LossTally;
use crate::model::{EntityRecord, PlatformSnapshot, VerificationTotals};
use crate::world::{EntitySpec, World};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportError {
    #[error("target surface of platform '{0}' is invalid")]
    SurfaceInvalid(String),
    #[error("platform '{0}' has no control hub")]
    HubMissing(String),
    #[error("platform '{0}' already exists")]
    PlatformExists(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ImportPhase {
    Tiles,
    HubMapping,
    Entities,
    Fluids,
    Belts,
    State,
    Activation,
    Complete,
}

impl ImportPhase {
    pub fn label(self) -> &'static str {
        match self {
            ImportPhase::Tiles => "tiles",
            ImportPhase::HubMapping => "hub_mapping",
            ImportPhase::Entities => "entities",
            ImportPhase::Fluids => "fluids",
            ImportPhase::Belts => "belts",
            ImportPhase::State => "state",
            ImportPhase::Activation => "activation",
            ImportPhase::Complete => "complete",
        }
    }

    fn next(self) -> ImportPhase {
        match self {
            ImportPhase::Tiles => ImportPhase::HubMapping,
            ImportPhase::HubMapping => ImportPhase::Entities,
            ImportPhase::Entities => ImportPhase::Fluids,
            ImportPhase::Fluids => ImportPhase::Belts,
            ImportPhase::Belts => ImportPhase::State,
            ImportPhase::State => ImportPhase::Activation,
            ImportPhase::Activation | ImportPhase::Complete => ImportPhase::Complete,
        }
    }
}

/// Outcome of a finished import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub platform: String,
    pub created: usize,
    pub mapped: usize,
    /// Source totals carried by the snapshot, for validation.
    pub expected: VerificationTotals,
    pub losses: LossTally,
}

#[derive(Debug)]
pub struct ImportJob {
    transfer_id: TransferId,
    platform: String,
    surface: SurfaceId,
    snapshot: PlatformSnapshot,
    entity_map: BTreeMap<StableId, EntityHandle>,
    phase: ImportPhase,
    cursor: usize,
    losses: LossTally,
    /// Cross-instance imports keep entities inert until phase 7.
    cross_instance: bool,
    created: usize,
    failure: Option<ImportError>,
}

impl ImportJob {
    /// Prepare an import onto an already created, empty platform.
    pub fn new(
        transfer_id: TransferId,
        platform: &str,
        surface: SurfaceId,
        snapshot: PlatformSnapshot,
        cross_instance: bool,
    ) -> Self {
        Self {
            transfer_id,
            platform: platform.to_string(),
            surface,
            snapshot,
            entity_map: BTreeMap::new(),
            phase: ImportPhase::Tiles,
            cursor: 0,
            losses: LossTally::new(),
            cross_instance,
            created: 0,
            failure: None,
        }
    }

    pub fn phase(&self) -> ImportPhase {
        self.phase
    }

    pub fn entity_map(&self) -> &BTreeMap<StableId, EntityHandle> {
        &self.entity_map
    }

    fn advance(&mut self) {
        let next = self.phase.next();
        tracing::debug!(
            platform = %self.platform,
            from = self.phase.label(),
            to = next.label(),
            "import_phase"
        );
        self.phase = next;
        self.cursor = 0;
    }

    fn abort(&mut self, err: ImportError) {
        tracing::warn!(
            platform = %self.platform,
            phase = self.phase.label(),
            error = %err,
            "import_aborted"
        );
        self.failure = Some(err);
        self.phase = ImportPhase::Complete;
    }

    // -- Phase 1 ----------------------------------------------------------

    fn place_tiles(&mut self, world: &mut dyn World) {
        if !world.surface_valid(self.surface) {
            self.abort(ImportError::SurfaceInvalid(self.platform.clone()));
            return;
        }
        if world.set_tiles(self.surface, &self.snapshot.tiles).is_err() {
            self.abort(ImportError::SurfaceInvalid(self.platform.clone()));
            return;
        }
        self.advance();
    }

    // -- Phase 2 ----------------------------------------------------------

    fn map_hub(&mut self, world: &mut dyn World) {
        let Some(record) = self
            .snapshot
            .entities
            .iter()
            .find(|r| r.category == EntityCategory::SpacePlatformHub)
        else {
            self.advance();
            return;
        };
        match world.hub(self.surface) {
            Some(hub) => {
                self.entity_map.insert(record.stable_id, hub);
                self.advance();
            }
            None => self.abort(ImportError::HubMissing(self.platform.clone())),
        }
    }

    // -- Phase 3 ----------------------------------------------------------

    fn create_entities(&mut self, ctx: &mut JobContext<'_>, budget: usize) -> usize {
        let total = self.snapshot.entities.len();
        let end = (self.cursor + budget).min(total);
        for i in self.cursor..end {
            let record = &self.snapshot.entities[i];
            if record.category == EntityCategory::ItemOnGround {
                continue;
            }
            let entity = match self.entity_map.get(&record.stable_id) {
                // The hub already exists; only its contents are restored.
                Some(&hub) => hub,
                None => {
                    let spec = EntitySpec {
                        name: &record.name,
                        position: record.position,
                        direction: record.direction,
                        orientation: record.orientation,
                        quality: &record.quality,
                        health: record.health,
                        variant: record.specific.creation_variant(),
                    };
                    match ctx.world.create_entity(self.surface, &spec) {
                        Ok(entity) => {
                            self.created += 1;
                            entity
                        }
                        Err(err) => {
                            tracing::debug!(
                                entity = %record.name,
                                error = %err,
                                "entity_creation_failed"
                            );
                            self.losses.record_entity_failure(record);
                            continue;
                        }
                    }
                }
            };
            if self.cross_instance && record.category.is_freezable() {
                ctx.world.set_active(entity, false);
            }
            self.entity_map.insert(record.stable_id, entity);
            restore_inventories(ctx.world, entity, record, &mut self.losses);
            ctx.categories.restore(ctx.world, entity, record, &mut self.losses);
        }
        let done = end - self.cursor;
        self.cursor = end;
        if self.cursor >= total {
            self.advance();
        }
        done
    }

    // -- Phase 6 ----------------------------------------------------------

    fn restore_state(&mut self, world: &mut dyn World, budget: usize) -> usize {
        let total = self.snapshot.entities.len();
        let end = (self.cursor + budget).min(total);
        for record in &self.snapshot.entities[self.cursor..end] {
            let Some(&entity) = self.entity_map.get(&record.stable_id) else {
                continue;
            };
            let mut ok = true;
            if let Some(behavior) = &record.control {
                ok &= world.set_control_behavior(entity, behavior);
            }
            if !record.filters.is_empty() {
                ok &= world.set_filters(entity, &record.filters);
            }
            if !record.logistic_requests.is_empty() {
                ok &= world.set_logistic_requests(entity, &record.logistic_requests);
            }
            if !record.tags.is_empty() {
                ok &= world.set_tags(entity, &record.tags);
            }
            if !ok {
                self.losses.state_failures += 1;
            }
            for wire in &record.wires {
                match self.entity_map.get(&wire.target) {
                    Some(&target) => {
                        let (from, to) = (wire.connector, wire.target_connector);
                        if !world.connect_wire(entity, from, target, to) {
                            self.losses.dangling_wires += 1;
                        }
                    }
                    None => self.losses.dangling_wires += 1,
                }
            }
        }
        let done = end - self.cursor;
        self.cursor = end;
        if self.cursor >= total {
            self.advance();
        }
        done
    }

    // -- Phase 7 ----------------------------------------------------------

    fn activate(&mut self, world: &mut dyn World, budget: usize) -> usize {
        let total = self.snapshot.entities.len();
        let end = (self.cursor + budget).min(total);
        for record in &self.snapshot.entities[self.cursor..end] {
            if !record.category.is_freezable() {
                continue;
            }
            let Some(&entity) = self.entity_map.get(&record.stable_id) else {
                continue;
            };
            let active = self
                .snapshot
                .frozen_states
                .get(&record.stable_id)
                .copied()
                .unwrap_or(true);
            world.set_active(entity, active);
        }
        let done = end - self.cursor;
        self.cursor = end;
        if self.cursor >= total {
            // The platform may travel again only once everything is awake.
            let meta = &self.snapshot.platform;
            if world.set_platform_schedule(&self.platform, meta.schedule.clone()).is_err()
                || world.set_platform_paused(&self.platform, meta.paused).is_err()
            {
                self.losses.state_failures += 1;
            }
            self.advance();
        }
        done
    }
}

/// Fill every recorded inventory. Anything not accepted is tallied.
fn restore_inventories(
    world: &mut dyn World,
    entity: EntityHandle,
    record: &EntityRecord,
    losses: &mut LossTally,
) {
    for inventory in &record.inventories {
        for stack in &inventory.stacks {
            let accepted = world.insert_items(entity, inventory.kind, stack);
            if accepted < stack.count {
                losses.add_items(&stack.name, (stack.count - accepted) as u64);
            }
        }
    }
}

impl Job for ImportJob {
    fn kind(&self) -> JobKind {
        JobKind::Import
    }

    fn platform(&self) -> &str {
        &self.platform
    }

    /// Three batched passes over the entity list plus the four
    /// single-step phases.
    fn total_work(&self) -> usize {
        self.snapshot.entities.len() * 3 + 4
    }

    fn progress(&self) -> JobProgress {
        let n = self.snapshot.entities.len();
        let done = match self.phase {
            ImportPhase::Tiles => 0,
            ImportPhase::HubMapping => 1,
            ImportPhase::Entities => 2 + self.cursor,
            ImportPhase::Fluids => 2 + n,
            ImportPhase::Belts => 3 + n,
            ImportPhase::State => 4 + n + self.cursor,
            ImportPhase::Activation => 4 + 2 * n + self.cursor,
            ImportPhase::Complete => self.total_work(),
        };
        JobProgress {
            phase: self.phase.label().to_string(),
            done,
            total: self.total_work(),
        }
    }

    fn step(&mut self, ctx: &mut JobContext<'_>, budget: usize) -> JobStatus {
        let mut remaining = budget.max(1);
        while remaining > 0 && self.phase != ImportPhase::Complete {
            let used = match self.phase {
                ImportPhase::Tiles => {
                    self.place_tiles(ctx.world);
                    1
                }
                ImportPhase::HubMapping => {
                    self.map_hub(ctx.world);
                    1
                }
                ImportPhase::Entities => self.create_entities(ctx, remaining),
                ImportPhase::Fluids => {
                    let summary = restore_fluids(
                        ctx.world,
                        &self.snapshot.entities,
                        &self.entity_map,
                        &mut self.losses,
                    );
                    tracing::debug!(
                        platform = %self.platform,
                        segments = summary.segments,
                        direct = summary.direct,
                        "fluids_restored"
                    );
                    self.advance();
                    1
                }
                ImportPhase::Belts => {
                    let summary = restore_belts(
                        ctx.world,
                        self.surface,
                        &self.snapshot.entities,
                        &self.entity_map,
                        &mut self.losses,
                    );
                    tracing::debug!(
                        platform = %self.platform,
                        exact = summary.exact,
                        fallback = summary.fallback,
                        "belts_restored"
                    );
                    self.advance();
                    1
                }
                ImportPhase::State => self.restore_state(ctx.world, remaining),
                ImportPhase::Activation => self.activate(ctx.world, remaining),
                ImportPhase::Complete => 0,
            };
            remaining = remaining.saturating_sub(used.max(1));
        }
        if self.phase == ImportPhase::Complete {
            JobStatus::Done
        } else {
            JobStatus::Pending
        }
    }

    fn finish(self: Box<Self>, _ctx: &mut JobContext<'_>) -> JobOutput {
        let this = *self;
        let result = match this.failure {
            Some(err) => Err(err),
            None => {
                if !this.losses.is_empty() {
                    tracing::warn!(
                        platform = %this.platform,
                        losses = %this.losses.summary(),
                        "import_losses"
                    );
                }
                tracing::info!(
                    platform = %this.platform,
                    created = this.created,
                    "import_complete"
                );
                Ok(ImportReport {
                    platform: this.platform.clone(),
                    created: this.created,
                    mapped: this.entity_map.len(),
                    expected: this.snapshot.totals,
                    losses: this.losses,
                })
            }
        };
        JobOutput::Import {
            transfer_id: this.transfer_id,
            platform: this.platform,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::CategoryRegistry;
    use crate::export::ExportJob;
    use crate::id::ExportId;
    use crate::job::{Scheduler, SchedulerConfig};
    use crate::lock::{LockConfig, LockTable};
    use crate::scanner::{live_totals, scan, stable_id};
    use crate::test_utils::*;

    fn export(world: &mut MemoryWorld, platform: &str) -> PlatformSnapshot {
        let mut table = LockTable::new();
        let record = table
            .lock(world, platform, &LockConfig::default())
            .unwrap()
            .clone();
        let categories = CategoryRegistry::default();
        let export = ExportJob::start(world, ExportId(1), platform, Some(&record)).unwrap();
        let mut job = Box::new(export);
        let mut ctx = JobContext {
            world,
            categories: &categories,
        };
        assert_eq!(job.step(&mut ctx, usize::MAX / 4), JobStatus::Done);
        match job.finish(&mut ctx) {
            JobOutput::Export { result, .. } => result.unwrap(),
            other => panic!("unexpected output {other:?}"),
        }
    }

    fn import(
        world: &mut MemoryWorld,
        snapshot: PlatformSnapshot,
        batch: usize,
    ) -> (usize, Result<ImportReport, ImportError>) {
        let surface = world.create_platform("beta", "player").unwrap();
        let categories = CategoryRegistry::default();
        let mut scheduler = Scheduler::new(SchedulerConfig {
            import_batch_size: batch,
            ..Default::default()
        });
        scheduler.enqueue(Box::new(ImportJob::new(TransferId(1), "beta", surface, snapshot, true)));
        let mut ticks = 0;
        loop {
            ticks += 1;
            let mut ctx = JobContext {
                world: &mut *world,
                categories: &categories,
            };
            if let Some(done) = scheduler.tick(&mut ctx).pop() {
                match done.output {
                    JobOutput::Import { result, .. } => return (ticks, result),
                    other => panic!("unexpected output {other:?}"),
                }
            }
            assert!(ticks < 100_000);
        }
    }

    // -----------------------------------------------------------------------
    // Test 1: mixed platform round trip loses nothing
    // -----------------------------------------------------------------------
    #[test]
    fn mixed_platform_round_trip() {
        let mut source = MemoryWorld::new();
        build_mixed_platform(&mut source, "alpha");
        let snapshot = export(&mut source, "alpha");
        let expected = snapshot.totals.clone();

        let mut dest = MemoryWorld::new();
        let (_, result) = import(&mut dest, snapshot, 7);
        let report = result.unwrap();
        assert!(report.losses.is_empty(), "{}", report.losses.summary());

        let surface = dest.platform("beta").unwrap().surface;
        let actual = live_totals(&dest, surface);
        assert!(expected.differences(&actual).is_empty(), "{:?}", expected.differences(&actual));
    }

    // -----------------------------------------------------------------------
    // Test 2: re-scan after import matches the source scan
    // -----------------------------------------------------------------------
    #[test]
    fn rescan_matches_source_records() {
        let mut source = MemoryWorld::new();
        build_mixed_platform(&mut source, "alpha");
        let source_surface = source.platform("alpha").unwrap().surface;
        let before = scan(&source, &CategoryRegistry::default(), source_surface);
        let snapshot = export(&mut source, "alpha");

        let mut dest = MemoryWorld::new();
        import(&mut dest, snapshot, 50).1.unwrap();
        let surface = dest.platform("beta").unwrap().surface;
        let after = scan(&dest, &CategoryRegistry::default(), surface);

        assert_eq!(before.len(), after.len());
        let wires_before: usize = before.iter().map(|r| r.wires.len()).sum();
        let wires_after: usize = after.iter().map(|r| r.wires.len()).sum();
        assert_eq!(wires_before, wires_after);
        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.position, b.position);
            assert_eq!(a.specific, b.specific, "{}", a.name);
            assert_eq!(a.control, b.control);
        }
    }

    // -----------------------------------------------------------------------
    // Test 3: activation restores pre-lock flags, including inactive ones
    // -----------------------------------------------------------------------
    #[test]
    fn activation_restores_frozen_states() {
        let mut source = MemoryWorld::new();
        build_mixed_platform(&mut source, "alpha");
        let snapshot = export(&mut source, "alpha");
        let frozen = snapshot.frozen_states.clone();
        assert!(frozen.values().any(|a| !a));

        let mut dest = MemoryWorld::new();
        import(&mut dest, snapshot, 50).1.unwrap();
        let surface = dest.platform("beta").unwrap().surface;
        for handle in dest.entities(surface) {
            let view = dest.entity(handle).unwrap();
            if let Some(&active) = frozen.get(&stable_id(&view)) {
                assert_eq!(view.active, active, "{}", view.name);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Test 4: entities stay inert until the activation phase
    // -----------------------------------------------------------------------
    #[test]
    fn entities_inert_before_activation() {
        let mut source = MemoryWorld::new();
        build_storage_platform(&mut source, "alpha", 0, 0);
        let surface = source.platform("alpha").unwrap().surface;
        place(&mut source, surface, "inserter", 1.5, 1.5);
        let snapshot = export(&mut source, "alpha");

        let mut dest = MemoryWorld::new();
        let dest_surface = dest.create_platform("beta", "player").unwrap();
        let categories = CategoryRegistry::default();
        let mut job = ImportJob::new(TransferId(1), "beta", dest_surface, snapshot, true);
        let mut ctx = JobContext {
            world: &mut dest,
            categories: &categories,
        };
        while job.phase() != ImportPhase::Activation {
            job.step(&mut ctx, 1);
        }
        let inserter = job
            .entity_map()
            .values()
            .copied()
            .find(|&h| ctx.world.entity(h).unwrap().name == "inserter")
            .unwrap();
        assert!(!ctx.world.entity(inserter).unwrap().active);
        while job.step(&mut ctx, 1) == JobStatus::Pending {}
        assert!(ctx.world.entity(inserter).unwrap().active);
    }

    // -----------------------------------------------------------------------
    // Test 5: failed creations are tallied and the pipeline continues
    // -----------------------------------------------------------------------
    #[test]
    fn creation_failure_is_tallied() {
        let mut source = MemoryWorld::new();
        build_storage_platform(&mut source, "alpha", 3, 300);
        let mut snapshot = export(&mut source, "alpha");
        let victim = snapshot
            .entities
            .iter_mut()
            .find(|r| r.name == "iron-chest")
            .unwrap();
        victim.name = "unobtainium-chest".into();
        let lost: u64 = victim.all_item_stacks().map(|s| s.count as u64).sum();

        let mut dest = MemoryWorld::new();
        let report = import(&mut dest, snapshot, 50).1.unwrap();
        assert_eq!(report.losses.entities_failed["unobtainium-chest"], 1);
        assert_eq!(report.losses.items_lost_total(), lost);
        assert_eq!(report.created, 2);
    }

    // -----------------------------------------------------------------------
    // Test 6: invalid target surface aborts in phase 1
    // -----------------------------------------------------------------------
    #[test]
    fn invalid_surface_aborts() {
        let mut source = MemoryWorld::new();
        build_storage_platform(&mut source, "alpha", 3, 30);
        let snapshot = export(&mut source, "alpha");

        let mut dest = MemoryWorld::new();
        let surface = dest.create_platform("beta", "player").unwrap();
        dest.delete_platform("beta").unwrap();
        let categories = CategoryRegistry::default();
        let mut job = Box::new(ImportJob::new(TransferId(1), "beta", surface, snapshot, true));
        let mut ctx = JobContext {
            world: &mut dest,
            categories: &categories,
        };
        assert_eq!(job.step(&mut ctx, 10), JobStatus::Done);
        match job.finish(&mut ctx) {
            JobOutput::Import { result, .. } => {
                assert_eq!(result.unwrap_err(), ImportError::SurfaceInvalid("beta".into()));
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Test 7: smaller budgets take more ticks but give the same result
    // -----------------------------------------------------------------------
    #[test]
    fn budget_only_changes_duration() {
        let mut a = MemoryWorld::new();
        build_storage_platform(&mut a, "alpha", 40, 800);
        let snapshot = export(&mut a, "alpha");

        let mut slow = MemoryWorld::new();
        let (slow_ticks, slow_report) = import(&mut slow, snapshot.clone(), 5);
        let mut fast = MemoryWorld::new();
        let (fast_ticks, fast_report) = import(&mut fast, snapshot, 1000);
        assert!(slow_ticks > fast_ticks);
        assert_eq!(fast_ticks, 1);
        assert_eq!(slow_report.unwrap(), fast_report.unwrap());
    }

    // -----------------------------------------------------------------------
    // Test 8: a wire the world refuses to connect is tallied
    // -----------------------------------------------------------------------
    #[test]
    fn refused_wire_is_tallied() {
        let mut source = MemoryWorld::new();
        build_mixed_platform(&mut source, "alpha");
        let mut snapshot = export(&mut source, "alpha");
        let record = snapshot.entities.iter_mut().find(|r| !r.wires.is_empty()).unwrap();
        // A wire from an entity to itself cannot be built.
        record.wires[0].target = record.stable_id;

        let mut dest = MemoryWorld::new();
        let report = import(&mut dest, snapshot, 50).1.unwrap();
        assert_eq!(report.losses.dangling_wires, 1);
        assert!(report.losses.summary().contains("dangling wires: 1"));
    }
}
