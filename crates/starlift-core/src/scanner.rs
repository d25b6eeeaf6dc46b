//! Entity/tile scanner.
//!
//! Walks a surface and produces a deterministic, totally ordered list of
//! [`EntityRecord`]s. Order is independent of the world's native iteration
//! order: records are sorted by stable id, then name, position, direction,
//! and ground items are appended afterwards in position order. Scanning is
//! read-only; entities that vanish mid-scan are skipped.

use std::collections::BTreeSet;

use crate::category::{CategoryRegistry, EntityCategory};
use crate::id::{EntityHandle, Fnv64, StableId, SurfaceId};
use crate::model::{
    Direction, EntityRecord, FluidRecord, ItemStack, NORMAL_QUALITY, Position, SpecificData,
    VerificationTotals, WireConnection,
};
use crate::world::{EntityView, World};

/// Entity name used for loose items lying on the ground.
pub const GROUND_ITEM_NAME: &str = "item-on-ground";

// ---------------------------------------------------------------------------
// Stable identifiers
// ---------------------------------------------------------------------------

/// Compute the stable id of a live entity: its unit number when the engine
/// assigns one, otherwise a hash of name, position, direction, orientation.
pub fn stable_id(view: &EntityView) -> StableId {
    match view.unit_number {
        Some(n) => StableId::from_unit_number(n),
        None => {
            let orientation = view.orientation.map(|o| o.to_bits());
            hashed_id(&view.name, view.position, view.direction, orientation)
        }
    }
}

fn hashed_id(
    name: &str,
    position: Position,
    direction: Direction,
    orientation: Option<i64>,
) -> StableId {
    let mut h = Fnv64::new();
    h.write_str(name);
    h.write_i64(position.x.to_bits());
    h.write_i64(position.y.to_bits());
    h.write_u8(direction.0);
    match orientation {
        Some(bits) => {
            h.write_u8(1);
            h.write_i64(bits);
        }
        None => h.write_u8(0),
    }
    StableId::from_hash(h.finish())
}

/// Stable id of a loose ground item.
pub fn ground_item_id(position: Position, stack: &ItemStack) -> StableId {
    let name = format!("{GROUND_ITEM_NAME}:{}:{}", stack.name, stack.quality);
    hashed_id(&name, position, Direction::NORTH, None)
}

// ---------------------------------------------------------------------------
// Single-entity extraction
// ---------------------------------------------------------------------------

/// Capture one entity. Returns `None` if it is no longer valid.
pub fn scan_entity(
    world: &dyn World,
    categories: &CategoryRegistry,
    entity: EntityHandle,
) -> Option<EntityRecord> {
    let view = world.entity(entity)?;

    let mut inventories = world.inventories(entity);
    inventories.retain(|inv| !inv.stacks.is_empty());
    inventories.sort_by_key(|inv| inv.kind);

    let fluids = world
        .fluid_boxes(entity)
        .into_iter()
        .filter_map(|fb| {
            fb.contents.map(|contents| FluidRecord {
                index: fb.index,
                contents,
                capacity: fb.capacity,
                segment: fb.segment,
            })
        })
        .collect();

    // Targets are resolved to stable ids now; wires to entities that no
    // longer exist are dropped here, wires leaving the snapshot later.
    let mut wires: Vec<WireConnection> = world
        .wires(entity)
        .into_iter()
        .filter_map(|link| {
            let target = world.entity(link.target)?;
            Some(WireConnection {
                connector: link.connector,
                target: stable_id(&target),
                target_connector: link.target_connector,
            })
        })
        .collect();
    wires.sort();
    wires.dedup();

    let specific = categories.extract(world, view.category, entity);

    Some(EntityRecord {
        stable_id: stable_id(&view),
        unit_number: view.unit_number,
        name: view.name,
        category: view.category,
        position: view.position,
        direction: view.direction,
        orientation: view.orientation,
        health: view.health,
        quality: view.quality,
        inventories,
        fluids,
        specific,
        wires,
        control: world.control_behavior(entity),
        filters: world.filters(entity),
        logistic_requests: world.logistic_requests(entity),
        tags: world.tags(entity),
    })
}

/// Capture loose ground items as records, in position order.
pub fn scan_ground_items(world: &dyn World, surface: SurfaceId) -> Vec<EntityRecord> {
    let mut records: Vec<EntityRecord> = world
        .ground_items(surface)
        .into_iter()
        .map(|(position, stack)| EntityRecord {
            stable_id: ground_item_id(position, &stack),
            unit_number: None,
            name: GROUND_ITEM_NAME.to_string(),
            category: EntityCategory::ItemOnGround,
            position,
            direction: Direction::NORTH,
            orientation: None,
            health: 0.0,
            quality: NORMAL_QUALITY.to_string(),
            inventories: Vec::new(),
            fluids: Vec::new(),
            specific: SpecificData::GroundItem { stack },
            wires: Vec::new(),
            control: None,
            filters: Vec::new(),
            logistic_requests: Vec::new(),
            tags: Default::default(),
        })
        .collect();
    records.sort_by(|a, b| (a.position, ground_stack(a)).cmp(&(b.position, ground_stack(b))));
    records
}

fn ground_stack(record: &EntityRecord) -> Option<&ItemStack> {
    match &record.specific {
        SpecificData::GroundItem { stack } => Some(stack),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Ordering and reference pruning
// ---------------------------------------------------------------------------

/// Sort entity records into their total order.
pub fn sort_records(records: &mut [EntityRecord]) {
    records.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// Drop wires whose target is not in `records`. Returns how many were dropped.
pub fn prune_dangling_wires(records: &mut [EntityRecord]) -> usize {
    let ids: BTreeSet<StableId> = records.iter().map(|r| r.stable_id).collect();
    let mut dropped = 0;
    for record in records.iter_mut() {
        let before = record.wires.len();
        record.wires.retain(|w| ids.contains(&w.target));
        dropped += before - record.wires.len();
    }
    dropped
}

/// Sort entity records, prune dangling wires, and append ground items.
pub fn finalize_records(
    mut records: Vec<EntityRecord>,
    ground: Vec<EntityRecord>,
) -> Vec<EntityRecord> {
    sort_records(&mut records);
    let dropped = prune_dangling_wires(&mut records);
    if dropped > 0 {
        tracing::debug!(dropped, "dangling_wires_pruned");
    }
    records.extend(ground);
    records
}

/// Scan a whole surface in one call.
pub fn scan(
    world: &dyn World,
    categories: &CategoryRegistry,
    surface: SurfaceId,
) -> Vec<EntityRecord> {
    let records: Vec<EntityRecord> = world
        .entities(surface)
        .into_iter()
        .filter_map(|entity| scan_entity(world, categories, entity))
        .collect();
    finalize_records(records, scan_ground_items(world, surface))
}

// ---------------------------------------------------------------------------
// Live totals
// ---------------------------------------------------------------------------

/// Totals measured directly from the live world, independently of any
/// records. Used both as the export-time consistency reference and as the
/// post-import measurement.
pub fn live_totals(world: &dyn World, surface: SurfaceId) -> VerificationTotals {
    let mut totals = VerificationTotals::default();
    let entities = world.entities(surface);
    for &entity in &entities {
        if world.entity(entity).is_none() {
            continue;
        }
        totals.entity_count += 1;
        for inv in world.inventories(entity) {
            for stack in &inv.stacks {
                totals.add_item(&stack.name, stack.count as u64);
            }
        }
        for lane in world.belt_lanes(entity) {
            for item in &lane {
                totals.add_item(&item.stack.name, item.stack.count as u64);
            }
        }
        if let Some(stack) = world.held_stack(entity) {
            totals.add_item(&stack.name, stack.count as u64);
        }
        for fb in world.fluid_boxes(entity) {
            if let Some(contents) = fb.contents {
                totals.add_fluid(&contents.name, contents.amount);
            }
        }
    }
    for (_, stack) in world.ground_items(surface) {
        totals.add_item(&stack.name, stack.count as u64);
    }
    totals.tile_count = world.tiles(surface).len() as u64;
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::f64_to_fixed64;
    use crate::test_utils::*;

    // -----------------------------------------------------------------------
    // Test 1: repeated scans are byte-identical
    // -----------------------------------------------------------------------
    #[test]
    fn repeated_scans_are_identical() {
        let mut world = MemoryWorld::new();
        let surface = build_mixed_platform(&mut world, "alpha");
        let categories = CategoryRegistry::default();

        let a = serde_json::to_string(&scan(&world, &categories, surface)).unwrap();
        let b = serde_json::to_string(&scan(&world, &categories, surface)).unwrap();
        assert_eq!(a, b);
    }

    // -----------------------------------------------------------------------
    // Test 2: order does not depend on native iteration order
    // -----------------------------------------------------------------------
    #[test]
    fn order_independent_of_iteration_order() {
        let mut world = MemoryWorld::new();
        let surface = build_mixed_platform(&mut world, "alpha");
        let categories = CategoryRegistry::default();

        let forward = scan(&world, &categories, surface);
        world.set_reverse_iteration(true);
        let reversed = scan(&world, &categories, surface);
        assert_eq!(forward, reversed);
    }

    // -----------------------------------------------------------------------
    // Test 3: records are sorted by stable id, ground items last
    // -----------------------------------------------------------------------
    #[test]
    fn records_sorted_with_ground_items_appended() {
        let mut world = MemoryWorld::new();
        let surface = build_mixed_platform(&mut world, "alpha");
        let records = scan(&world, &CategoryRegistry::default(), surface);

        let first_ground = records
            .iter()
            .position(|r| r.category == EntityCategory::ItemOnGround)
            .expect("mixed platform has ground items");
        assert!(records[first_ground..]
            .iter()
            .all(|r| r.category == EntityCategory::ItemOnGround));
        let entities = &records[..first_ground];
        assert!(entities.windows(2).all(|w| w[0].sort_key() <= w[1].sort_key()));
    }

    // -----------------------------------------------------------------------
    // Test 4: entities without unit numbers get reproducible hashed ids
    // -----------------------------------------------------------------------
    #[test]
    fn hashed_ids_are_reproducible() {
        let mut world = MemoryWorld::new();
        let surface = new_platform(&mut world, "alpha", 4);
        let pipe = place(&mut world, surface, "pipe", 1.5, 1.5);
        let view = world.entity(pipe).unwrap();
        assert!(view.unit_number.is_none());

        let id = stable_id(&view);
        assert!(id.is_hashed());
        assert_eq!(id, stable_id(&world.entity(pipe).unwrap()));

        let mut other = MemoryWorld::new();
        let other_surface = new_platform(&mut other, "beta", 4);
        let other_pipe = place(&mut other, other_surface, "pipe", 1.5, 1.5);
        assert_eq!(id, stable_id(&other.entity(other_pipe).unwrap()));
    }

    // -----------------------------------------------------------------------
    // Test 5: wires resolve to stable ids of the target
    // -----------------------------------------------------------------------
    #[test]
    fn wires_resolve_to_target_ids() {
        let mut world = MemoryWorld::new();
        let surface = new_platform(&mut world, "alpha", 4);
        let a = place(&mut world, surface, "constant-combinator", 0.5, 1.5);
        let b = place(&mut world, surface, "small-lamp", 1.5, 1.5);
        let red = crate::model::WireConnector::red(0);
        world.connect_wire(a, red, b, red);

        let records = scan(&world, &CategoryRegistry::default(), surface);
        let lamp_id = stable_id(&world.entity(b).unwrap());
        let combinator = records
            .iter()
            .find(|r| r.name == "constant-combinator")
            .unwrap();
        assert_eq!(combinator.wires.len(), 1);
        assert_eq!(combinator.wires[0].target, lamp_id);
    }

    // -----------------------------------------------------------------------
    // Test 6: wires leaving the snapshot are pruned
    // -----------------------------------------------------------------------
    #[test]
    fn dangling_wires_are_pruned() {
        let mut records = vec![make_record(1, "small-lamp"), make_record(2, "small-lamp")];
        records[0].wires.push(WireConnection {
            connector: crate::model::WireConnector::red(0),
            target: StableId::from_unit_number(2),
            target_connector: crate::model::WireConnector::red(0),
        });
        records[0].wires.push(WireConnection {
            connector: crate::model::WireConnector::green(0),
            target: StableId::from_unit_number(99),
            target_connector: crate::model::WireConnector::green(0),
        });
        assert_eq!(prune_dangling_wires(&mut records), 1);
        assert_eq!(records[0].wires.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Test 7: belt lanes keep exact slot positions
    // -----------------------------------------------------------------------
    #[test]
    fn belt_lanes_keep_positions() {
        let mut world = MemoryWorld::new();
        let surface = new_platform(&mut world, "alpha", 4);
        let belt = place(&mut world, surface, "transport-belt", 1.5, 0.5);
        let stack = ItemStack::new("iron-plate", 1);
        assert!(world.belt_insert_at(belt, 1, f64_to_fixed64(0.5), &stack));

        let records = scan(&world, &CategoryRegistry::default(), surface);
        let record = records.iter().find(|r| r.name == "transport-belt").unwrap();
        match &record.specific {
            SpecificData::Belt { lanes, .. } => {
                assert!(lanes[0].is_empty());
                assert_eq!(lanes[1][0].position, f64_to_fixed64(0.5));
            }
            other => panic!("unexpected specific data {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Test 8: record-derived totals agree with live totals
    // -----------------------------------------------------------------------
    #[test]
    fn record_totals_match_live_totals() {
        let mut world = MemoryWorld::new();
        let surface = build_mixed_platform(&mut world, "alpha");
        let records = scan(&world, &CategoryRegistry::default(), surface);
        let derived = VerificationTotals::from_records(&records, world.tiles(surface).len());
        let live = live_totals(&world, surface);
        assert!(derived.differences(&live).is_empty(), "{:?}", derived.differences(&live));
    }

    // -----------------------------------------------------------------------
    // Test 9: invalid entities are skipped
    // -----------------------------------------------------------------------
    #[test]
    fn invalid_entities_are_skipped() {
        let mut world = MemoryWorld::new();
        let surface = new_platform(&mut world, "alpha", 4);
        let chest = place(&mut world, surface, "iron-chest", 0.5, 1.5);
        world.destroy_entity(chest);
        assert!(scan_entity(&world, &CategoryRegistry::default(), chest).is_none());
    }
}
