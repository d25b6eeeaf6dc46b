//! Full transfers between two in-memory processes.
//!
//! Every test here drives real instances through the controller: lock,
//! batched export, chunked transport, seven-phase import, validation and
//! source deletion.

mod common;

use common::*;
use starlift_controller::config::ControllerConfig;
use starlift_controller::transfer::TransferState;
use starlift_core::category::CategoryRegistry;
use starlift_core::codec::{BodyEncoding, TransportConfig};
use starlift_core::config::TransferConfig;
use starlift_core::job::SchedulerConfig;
use starlift_core::model::Position;
use starlift_core::scanner::scan;
use starlift_core::test_utils::*;
use starlift_core::world::World;

fn states_of(h: &Harness, id: starlift_core::id::TransferId) -> Vec<TransferState> {
    h.controller.log().states(id)
}

// ===========================================================================
// Scale
// ===========================================================================

#[test]
fn five_hundred_entities_ten_thousand_items() {
    let mut world = MemoryWorld::new();
    build_storage_platform(&mut world, "freighter", 499, 10_000);
    assert_eq!(world.entity_count(), 500);

    let mut h = Harness::with_defaults(world);
    let before = totals(&h.source, "freighter").unwrap();
    assert_eq!(before.total_items(), 10_000);

    let id = h.start("freighter");
    assert_eq!(h.run(id), TransferState::Completed);

    use TransferState::*;
    assert_eq!(
        states_of(&h, id),
        vec![Created, Locked, Exporting, Exported, Importing, Validating, Completed]
    );
    assert!(totals(&h.source, "freighter").is_none(), "source should be deleted");

    let after = totals(&h.destination, "freighter").unwrap();
    assert_eq!(after.items, before.items);
    assert_eq!(after.entity_count, before.entity_count);
    assert_eq!(after.tile_count, before.tile_count);

    let record = h.controller.transfer(id).unwrap();
    assert!(record.losses.as_ref().unwrap().is_empty());
    assert!(record.validation.as_ref().unwrap().success());
    assert!(record.chunk_count >= 1);

    // Timing is monotonic and deltas add up to the elapsed total.
    let events = h.controller.log().for_transfer(id);
    let deltas: u64 = events.iter().map(|e| e.delta_ms).sum();
    assert_eq!(deltas, events.last().unwrap().elapsed_ms);
}

// ===========================================================================
// Fidelity
// ===========================================================================

#[test]
fn mixed_platform_round_trip() {
    let mut world = MemoryWorld::new();
    build_mixed_platform(&mut world, "alpha");
    let mut h = Harness::with_defaults(world);
    let before = totals(&h.source, "alpha").unwrap();

    let id = h.start("alpha");
    assert_eq!(h.run(id), TransferState::Completed);

    let after = totals(&h.destination, "alpha").unwrap();
    assert_eq!(after.items, before.items);
    assert_eq!(after.fluids.keys().collect::<Vec<_>>(), before.fluids.keys().collect::<Vec<_>>());
    for (name, amount) in &before.fluids {
        assert!((after.fluids[name] - amount).abs() < 1e-6, "{name} drifted");
    }

    let dest = h.destination.borrow();
    let world = dest.world();
    let surface = world.platform("alpha").unwrap().surface;
    let entities = world.entities(surface);
    let at = |x: f64, y: f64| {
        entities
            .iter()
            .filter_map(|&e| world.entity(e))
            .find(|v| v.position == Position::new(x, y))
            .unwrap()
    };

    // The lamp switched off before the lock stays off; its neighbour wakes up.
    assert!(!at(5.5, 7.5).active);
    assert!(at(2.5, 7.5).active);

    // Three wires, each seen from both ends.
    let wire_ends: usize = entities.iter().map(|&e| world.wires(e).len()).sum();
    assert_eq!(wire_ends, 6);

    assert_eq!(world.recipe_state(at(7.5, 1.5).handle).unwrap().recipe, "iron-gear-wheel");
    assert_eq!(world.container_bar(at(6.5, 1.5).handle), Some(5));
    assert_eq!(world.ground_items(surface).len(), 2);
}

#[test]
fn rebuilt_platform_scans_deterministically() {
    let mut world = MemoryWorld::new();
    build_mixed_platform(&mut world, "alpha");
    let mut h = Harness::with_defaults(world);
    let id = h.start("alpha");
    assert_eq!(h.run(id), TransferState::Completed);

    let mut dest = h.destination.borrow_mut();
    let surface = dest.world().platform("alpha").unwrap().surface;
    let categories = CategoryRegistry::default();
    let first = scan(dest.world(), &categories, surface);
    dest.world_mut().set_reverse_iteration(true);
    let second = scan(dest.world(), &categories, surface);
    assert_eq!(first, second);
}

#[test]
fn stored_payload_decodes_to_exported_totals() {
    let mut world = MemoryWorld::new();
    build_storage_platform(&mut world, "cargo", 20, 900);
    let mut h = Harness::with_defaults(world);
    let before = totals(&h.source, "cargo").unwrap();
    let id = h.start("cargo");
    assert_eq!(h.run(id), TransferState::Completed);

    let export_id = h.controller.transfer(id).unwrap().export_id;
    let stored = h.controller.store().get(export_id).unwrap();
    assert_eq!(stored.platform, "cargo");
    let snapshot = stored.decode().unwrap();
    assert_eq!(snapshot.totals.items, before.items);
    assert_eq!(h.controller.store().total_stored(), 1);
}

// ===========================================================================
// Configuration variants
// ===========================================================================

#[test]
fn bitcode_uncompressed_small_chunks() {
    let transfer = TransferConfig {
        transport: TransportConfig {
            encoding: BodyEncoding::Bitcode,
            compress: false,
            chunk_size: 512,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut world = MemoryWorld::new();
    build_mixed_platform(&mut world, "alpha");
    let mut h = Harness::new(world, transfer, ControllerConfig::default());
    let id = h.start("alpha");
    assert_eq!(h.run(id), TransferState::Completed);
    assert!(h.controller.transfer(id).unwrap().chunk_count > 1);
}

#[test]
fn sync_mode_finishes_in_fewer_ticks() {
    let build = || {
        let mut world = MemoryWorld::new();
        build_storage_platform(&mut world, "cargo", 200, 2000);
        world
    };
    let ticks_with = |scheduler: SchedulerConfig| {
        let transfer = TransferConfig {
            scheduler,
            ..Default::default()
        };
        let mut h = Harness::new(build(), transfer, ControllerConfig::default());
        let id = h.start("cargo");
        assert_eq!(h.run(id), TransferState::Completed);
        h.now / TICK_MS
    };
    let batched = ticks_with(SchedulerConfig::default());
    let sync = ticks_with(SchedulerConfig {
        sync_mode: true,
        ..Default::default()
    });
    assert!(sync < batched, "sync {sync} vs batched {batched}");
}

#[test]
fn sequential_transfers_of_different_platforms() {
    let mut world = MemoryWorld::new();
    build_storage_platform(&mut world, "one", 5, 50);
    build_storage_platform(&mut world, "two", 5, 70);
    let mut h = Harness::with_defaults(world);
    let first = h.start("one");
    let second = h.start("two");
    assert_eq!(h.run(first), TransferState::Completed);
    assert_eq!(h.run(second), TransferState::Completed);
    assert_eq!(totals(&h.destination, "one").unwrap().total_items(), 50);
    assert_eq!(totals(&h.destination, "two").unwrap().total_items(), 70);
    assert!(h.controller.is_idle());
}

#[test]
fn finished_transfers_release_source_exports() {
    let names = ["p1", "p2", "p3", "p4", "p5"];
    let mut world = MemoryWorld::new();
    for name in names {
        build_storage_platform(&mut world, name, 3, 30);
    }
    let mut h = Harness::with_defaults(world);
    for name in names {
        let id = h.start(name);
        assert_eq!(h.run(id), TransferState::Completed);
    }
    let source = h.source.borrow();
    assert!(source.registry().exports.is_empty());
    assert!(source.registry().locks.platforms().is_empty());
    assert_eq!(h.controller.store().total_stored(), 5);
}

// ===========================================================================
// Persistence
// ===========================================================================

#[test]
fn config_file_and_transaction_log_on_disk() {
    use starlift_controller::log::TransactionLog;

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("transfers.jsonl");
    let config_path = dir.path().join("controller.json");
    let config = serde_json::json!({
        "validation_timeout_ms": 60_000,
        "transaction_log_path": log_path,
    });
    std::fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    let config = ControllerConfig::load(&config_path).unwrap();
    assert_eq!(config.validation_timeout_ms, 60_000);
    assert_eq!(config.max_chunk_resends, 3);

    let mut world = MemoryWorld::new();
    build_storage_platform(&mut world, "cargo", 8, 80);
    let mut h = Harness::new(world, TransferConfig::default(), config);
    let id = h.start("cargo");
    assert_eq!(h.run(id), TransferState::Completed);

    let on_disk = TransactionLog::load(&log_path).unwrap();
    assert_eq!(on_disk.len(), 7);
    assert!(on_disk.iter().all(|e| e.transfer_id == id));
    assert_eq!(on_disk.last().unwrap().state, TransferState::Completed);
}
