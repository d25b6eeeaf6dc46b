//! Transfers that must not complete: validation tolerances, explicit
//! validation failure, validation timeout, chunk timeout, transport
//! outages and lock failures. In every case the source survives intact.

mod common;

use common::*;
use starlift_controller::config::ControllerConfig;
use starlift_controller::transfer::{FailureKind, TransferState};
use starlift_core::codec::TransportConfig;
use starlift_core::config::TransferConfig;
use starlift_core::instance::Instance;
use starlift_core::model::{ItemStack, Position, VerificationTotals};
use starlift_core::protocol::{Instruction, Response};
use starlift_core::test_utils::*;
use starlift_core::validation::{ToleranceConfig, Verdict, validate};
use starlift_core::world::World;

// ===========================================================================
// Tolerance table
// ===========================================================================

fn items(entries: &[(&str, u64)]) -> VerificationTotals {
    let mut totals = VerificationTotals::default();
    for (name, count) in entries {
        totals.add_item(name, *count);
    }
    totals
}

fn verdict_for(source: &VerificationTotals, dest: &VerificationTotals, item: &str) -> Verdict {
    validate(source, dest, &ToleranceConfig::default())
        .metrics
        .items
        .iter()
        .find(|c| c.name == item)
        .unwrap()
        .verdict
}

#[test]
fn tolerance_table() {
    let tol = ToleranceConfig::default();

    // 1% loss warns and passes.
    let source = items(&[("iron-plate", 500)]);
    let dest = items(&[("iron-plate", 495)]);
    assert!(validate(&source, &dest, &tol).success());
    assert_eq!(verdict_for(&source, &dest, "iron-plate"), Verdict::Warn);

    // 10% loss is still under the absolute threshold.
    let dest = items(&[("iron-plate", 450)]);
    assert!(validate(&source, &dest, &tol).success());
    assert_eq!(verdict_for(&source, &dest, "iron-plate"), Verdict::Warn);

    // Total loss of 500 fails.
    let source = items(&[("copper-plate", 500)]);
    let dest = items(&[]);
    let result = validate(&source, &dest, &tol);
    assert!(!result.success());
    assert!(!result.item_count_match);
    assert!(result.mismatch_details.contains("copper-plate"));

    // Ten of an item the source never had is a gain above five.
    let source = items(&[("iron-plate", 100)]);
    let dest = items(&[("iron-plate", 100), ("uranium-235", 10)]);
    assert!(!validate(&source, &dest, &tol).success());

    // Fluid that vanished completely fails.
    let mut source = VerificationTotals::default();
    source.add_fluid("water", 1200.0);
    let result = validate(&source, &VerificationTotals::default(), &tol);
    assert!(!result.success());
    assert!(!result.fluid_count_match);
    assert!(result.item_count_match);
}

// ===========================================================================
// Explicit validation failure
// ===========================================================================

/// Destroy every chest carrying copper once the import has created all
/// entities but before it finishes, so validation sees a total loss.
fn copper_saboteur(
    platform: &'static str,
    entities: usize,
) -> impl FnMut(&mut Instance<MemoryWorld>) {
    let mut done = false;
    move |instance| {
        if done || instance.registry().scheduler.is_idle() {
            return;
        }
        let world = instance.world_mut();
        let Some(info) = world.platform(platform) else {
            return;
        };
        let all = world.entities(info.surface);
        if all.len() < entities {
            return;
        }
        let copper: Vec<_> = all
            .into_iter()
            .filter(|&e| {
                world
                    .inventories(e)
                    .iter()
                    .any(|inv| inv.stacks.iter().any(|s| s.name == "copper-plate"))
            })
            .collect();
        for entity in copper {
            world.destroy_entity(entity);
        }
        done = true;
    }
}

fn sabotaged_transfer(
    cleanup: bool,
) -> (Harness, starlift_core::id::TransferId, VerificationTotals) {
    let mut world = MemoryWorld::new();
    // 40 chests of 100 items, a quarter of them copper.
    build_storage_platform(&mut world, "cargo", 40, 4000);
    let mut h = Harness::new(
        world,
        TransferConfig::default(),
        ControllerConfig {
            cleanup_destination_on_rollback: cleanup,
            ..Default::default()
        },
    );
    let before = totals(&h.source, "cargo").unwrap();
    let id = h.start("cargo");
    let state = h.run_with(id, copper_saboteur("cargo", 41));
    assert_eq!(state, TransferState::RolledBack);
    (h, id, before)
}

#[test]
fn validation_failure_rolls_back() {
    let (h, id, before) = sabotaged_transfer(false);
    let record = h.controller.transfer(id).unwrap();
    assert_eq!(record.failure, Some(FailureKind::Validation));
    assert!(!record.validation.as_ref().unwrap().success());

    use TransferState::*;
    assert_eq!(
        h.controller.log().states(id),
        vec![Created, Locked, Exporting, Exported, Importing, Validating, RolledBack]
    );

    // Source untouched and released.
    assert_eq!(totals(&h.source, "cargo").unwrap().items, before.items);
    let source = h.source.borrow();
    assert!(!source.registry().locks.is_locked("cargo"));
    assert!(!source.world().platform("cargo").unwrap().hidden);
    assert!(source.registry().exports.is_empty());

    // The partial copy is left for manual cleanup.
    assert!(totals(&h.destination, "cargo").is_some());
}

#[test]
fn rollback_can_clean_destination() {
    let (h, id, _) = sabotaged_transfer(true);
    assert_eq!(h.controller.transfer(id).unwrap().failure, Some(FailureKind::Validation));
    assert!(totals(&h.destination, "cargo").is_none());
    assert!(totals(&h.source, "cargo").is_some());
}

// ===========================================================================
// Timeouts
// ===========================================================================

#[test]
fn validation_timeout_is_logged_distinctly() {
    let mut world = MemoryWorld::new();
    build_storage_platform(&mut world, "cargo", 10, 100);
    let mut h = Harness::new(
        world,
        TransferConfig::default(),
        ControllerConfig {
            validation_timeout_ms: 2_000,
            ..Default::default()
        },
    );
    let id = h.start("cargo");
    h.run_until(id, TransferState::Importing, false);
    // The destination stalls: its import never runs.
    while !h.state(id).is_terminal() {
        h.step(false);
    }
    let record = h.controller.transfer(id).unwrap();
    assert_eq!(record.state, TransferState::RolledBack);
    assert_eq!(record.failure, Some(FailureKind::ValidationTimeout));

    let last = h.controller.log().most_recent().unwrap();
    assert_eq!(last.previous, Some(TransferState::Importing));
    assert_eq!(last.failure, Some(FailureKind::ValidationTimeout));
    assert!(last.detail.contains("no validation report"));
    assert!(!h.source.borrow().registry().locks.is_locked("cargo"));

    // A report arriving after the window changes nothing.
    for _ in 0..50 {
        h.step(true);
    }
    assert_eq!(h.state(id), TransferState::RolledBack);
}

#[test]
fn chunk_timeout_rolls_back() {
    let transfer = TransferConfig {
        transport: TransportConfig {
            chunk_size: 128,
            chunk_timeout_ticks: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut world = MemoryWorld::new();
    build_mixed_platform(&mut world, "alpha");
    let mut h = Harness::new(
        world,
        transfer,
        ControllerConfig {
            chunks_per_poll: 1,
            max_chunk_resends: 100,
            ..Default::default()
        },
    );
    let id = h.start("alpha");
    h.run_until(id, TransferState::Exported, true);

    // Every poll makes two calls to the destination (messages, push); the
    // outage spans more ticks than the session timeout.
    h.destination_channel.borrow_mut().fail_next(24);
    let state = h.run(id);
    assert_eq!(state, TransferState::RolledBack);
    assert_eq!(h.controller.transfer(id).unwrap().failure, Some(FailureKind::ChunkTimeout));
    assert!(totals(&h.destination, "alpha").is_none());
    assert!(!h.source.borrow().registry().locks.is_locked("alpha"));
}

#[test]
fn exhausted_resends_roll_back() {
    let transfer = TransferConfig {
        transport: TransportConfig {
            chunk_size: 128,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut world = MemoryWorld::new();
    build_mixed_platform(&mut world, "alpha");
    let mut h = Harness::new(
        world,
        transfer,
        ControllerConfig {
            chunks_per_poll: 1,
            max_chunk_resends: 3,
            ..Default::default()
        },
    );
    let id = h.start("alpha");
    h.run_until(id, TransferState::Exported, true);
    h.destination_channel.borrow_mut().fail_next(u32::MAX);
    assert_eq!(h.run(id), TransferState::RolledBack);
    assert_eq!(h.controller.transfer(id).unwrap().failure, Some(FailureKind::ChunkTransport));
    assert!(totals(&h.source, "alpha").is_some());
}

// ===========================================================================
// Locking
// ===========================================================================

#[test]
fn stuck_delivery_fails_lock() {
    let mut world = MemoryWorld::new();
    build_storage_platform(&mut world, "cargo", 4, 40);
    world.add_pending_delivery("cargo", ItemStack::new("iron-plate", 10), true);
    let mut h = Harness::with_defaults(world);
    let id = h.start("cargo");

    let record = h.controller.transfer(id).unwrap();
    assert_eq!(record.state, TransferState::Failed);
    assert_eq!(record.failure, Some(FailureKind::Lock));
    assert_eq!(
        h.controller.log().states(id),
        vec![TransferState::Created, TransferState::Failed]
    );
    assert!(!h.source.borrow().registry().locks.is_locked("cargo"));

    // A failed attempt does not block the next one.
    assert!(h.controller.start_transfer("cargo", SOURCE, DESTINATION, h.now).is_ok());
}

#[test]
fn in_flight_platform_rejects_second_transfer() {
    let mut world = MemoryWorld::new();
    build_storage_platform(&mut world, "cargo", 4, 40);
    let mut h = Harness::with_defaults(world);
    let first = h.start("cargo");
    assert!(h.controller.start_transfer("cargo", SOURCE, DESTINATION, h.now).is_err());
    assert_eq!(h.run(first), TransferState::Completed);
}

#[test]
fn lock_is_idempotent_and_unlock_restores_flags() {
    let mut world = MemoryWorld::new();
    let surface = build_mixed_platform(&mut world, "alpha");
    let find = |world: &MemoryWorld, x: f64, y: f64| {
        world
            .entities(surface)
            .into_iter()
            .find(|&e| world.entity(e).is_some_and(|v| v.position == Position::new(x, y)))
            .unwrap()
    };
    let idle_lamp = find(&world, 5.5, 7.5);
    let lamp = find(&world, 2.5, 7.5);

    let mut instance = Instance::new(SOURCE, world, TransferConfig::default());
    let lock = Instruction::Lock {
        platform: "alpha".into(),
    };
    assert!(matches!(instance.handle(lock.clone()), Response::Locked { .. }));
    let frozen = instance.registry().locks.get("alpha").unwrap().frozen_states.clone();
    assert!(!instance.world().entity(lamp).unwrap().active);

    assert!(matches!(instance.handle(lock), Response::Error(_)));
    assert_eq!(instance.registry().locks.get("alpha").unwrap().frozen_states, frozen);

    assert!(matches!(
        instance.handle(Instruction::Unlock {
            platform: "alpha".into()
        }),
        Response::Unlocked { .. }
    ));
    assert!(instance.world().entity(lamp).unwrap().active);
    assert!(!instance.world().entity(idle_lamp).unwrap().active);
}
