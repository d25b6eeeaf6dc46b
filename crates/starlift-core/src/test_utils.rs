//! Shared test helpers for unit tests, integration tests and the demo.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests and, via the `test-utils` feature, to other
//! crates in the workspace.

use std::collections::BTreeMap;

use crate::category::EntityCategory;
use crate::id::{EntityHandle, StableId, SurfaceId};
use crate::instance::Instance;
use crate::model::{
    CircuitCondition, Comparator, ControlBehavior, Direction, EntityFilter, EntityRecord,
    FluidContents, InventoryKind, ItemStack, LogisticRequest, NORMAL_QUALITY, Position,
    RecipeState, SignalFilter, SignalId, SignalSection, SpecificData, SplitterSettings,
    TileRecord, WireConnector,
};
use crate::world::{EntitySpec, World};

pub use crate::memory_world::{HUB_NAME, MemoryWorld, STACK_SIZE};

/// Tile name used for every generated platform floor.
pub const FOUNDATION: &str = "space-platform-foundation";

/// Items spread across storage platforms, in rotation.
pub const STORAGE_ITEMS: [&str; 4] = ["iron-plate", "copper-plate", "steel-plate", "plastic-bar"];

// ===========================================================================
// Platforms and placement
// ===========================================================================

/// Create a platform with a `size` x `size` square of foundation tiles.
pub fn new_platform(world: &mut MemoryWorld, name: &str, size: i32) -> SurfaceId {
    let surface = world.create_platform(name, "player").unwrap();
    let tiles: Vec<TileRecord> = (0..size)
        .flat_map(|x| {
            (0..size).map(move |y| TileRecord {
                name: FOUNDATION.to_string(),
                x,
                y,
            })
        })
        .collect();
    world.set_tiles(surface, &tiles).unwrap();
    surface
}

/// Place a north-facing entity of normal quality.
pub fn place(
    world: &mut MemoryWorld,
    surface: SurfaceId,
    name: &str,
    x: f64,
    y: f64,
) -> EntityHandle {
    place_with(world, surface, name, x, y, Direction::NORTH, None)
}

pub fn place_with(
    world: &mut MemoryWorld,
    surface: SurfaceId,
    name: &str,
    x: f64,
    y: f64,
    direction: Direction,
    variant: Option<&str>,
) -> EntityHandle {
    world
        .create_entity(
            surface,
            &EntitySpec {
                name,
                position: Position::new(x, y),
                direction,
                orientation: None,
                quality: NORMAL_QUALITY,
                health: 100.0,
                variant,
            },
        )
        .unwrap()
}

/// A platform of `chests` iron chests holding `total_items` items between
/// them, in rows below the hub.
pub fn build_storage_platform(
    world: &mut MemoryWorld,
    name: &str,
    chests: usize,
    total_items: u64,
) -> SurfaceId {
    let side = ((chests as f64).sqrt().ceil() as i32 + 2).max(4);
    let surface = new_platform(world, name, side);
    for i in 0..chests {
        let x = (i as i32 % side) as f64 + 0.5;
        let y = (i as i32 / side) as f64 + 1.5;
        let chest = place(world, surface, "iron-chest", x, y);
        let remainder = u64::from((i as u64) < total_items % chests as u64);
        let share = total_items / chests as u64 + remainder;
        if share > 0 {
            let item = STORAGE_ITEMS[i % STORAGE_ITEMS.len()];
            world.insert_items(chest, InventoryKind::Main, &ItemStack::new(item, share as u32));
        }
    }
    surface
}

/// A small platform that exercises every restore path: belts with items
/// at exact slots, an underground belt and a splitter, an inserter holding
/// an item, a crafting machine mid-recipe, a fluid segment spanning pipes,
/// a tank and a pump, a lone thruster, circuit wiring, logistic requests,
/// ground items, and one freezable entity already switched off.
pub fn build_mixed_platform(world: &mut MemoryWorld, name: &str) -> SurfaceId {
    use crate::fixed::f64_to_fixed64;

    let surface = new_platform(world, name, 10);
    let hub = world.hub(surface).unwrap();
    world.insert_items(hub, InventoryKind::Main, &ItemStack::new("iron-plate", 200));
    world.insert_items(hub, InventoryKind::Main, &ItemStack::new("copper-plate", 50));

    // -- Row 1: logistics and production ----------------------------------
    let belt = place_with(world, surface, "transport-belt", 1.5, 1.5, Direction::EAST, None);
    world.belt_insert_at(belt, 0, f64_to_fixed64(0.25), &ItemStack::new("iron-plate", 1));
    world.belt_insert_at(belt, 0, f64_to_fixed64(0.75), &ItemStack::new("copper-plate", 1));
    world.belt_insert_at(belt, 1, f64_to_fixed64(0.5), &ItemStack::new("iron-gear-wheel", 1));
    let belt2 = place_with(world, surface, "transport-belt", 2.5, 1.5, Direction::EAST, None);
    world.belt_insert_at(belt2, 0, f64_to_fixed64(0.0), &ItemStack::new("coal", 1));

    let underground = place_with(
        world,
        surface,
        "underground-belt",
        3.5,
        1.5,
        Direction::EAST,
        Some("output"),
    );
    world.belt_insert_at(underground, 1, f64_to_fixed64(0.25), &ItemStack::new("stone", 1));

    let splitter = place_with(world, surface, "splitter", 4.5, 1.5, Direction::EAST, None);
    world.set_splitter_settings(
        splitter,
        &SplitterSettings {
            input_priority: "left".into(),
            output_priority: "right".into(),
            filter: Some("iron-plate".into()),
        },
    );

    let inserter = place(world, surface, "inserter", 5.5, 1.5);
    world.set_held_stack(inserter, &ItemStack::new("iron-gear-wheel", 1));
    world.set_filters(
        inserter,
        &[EntityFilter {
            index: 0,
            name: "iron-gear-wheel".into(),
            quality: None,
        }],
    );

    let chest = place(world, surface, "iron-chest", 6.5, 1.5);
    world.insert_items(chest, InventoryKind::Main, &ItemStack::new("iron-gear-wheel", 40));
    let rare_steel = ItemStack::new("steel-plate", 12).with_quality("rare");
    world.insert_items(chest, InventoryKind::Main, &rare_steel);
    world.set_container_bar(chest, Some(5));
    world.set_tags(chest, &BTreeMap::from([("label".to_string(), "spares".to_string())]));

    let assembler = place(world, surface, "assembling-machine-1", 7.5, 1.5);
    world.set_recipe_state(
        assembler,
        &RecipeState {
            recipe: "iron-gear-wheel".into(),
            quality: NORMAL_QUALITY.into(),
            progress: 0.5,
            productivity_progress: 0.0,
        },
    );
    world.insert_items(assembler, InventoryKind::Input, &ItemStack::new("iron-plate", 20));
    world.insert_items(assembler, InventoryKind::Output, &ItemStack::new("iron-gear-wheel", 3));

    // -- Row 3: fluids ----------------------------------------------------
    place(world, surface, "pipe", 1.5, 3.5);
    place(world, surface, "pipe", 2.5, 3.5);
    let tank = place(world, surface, "storage-tank", 3.5, 3.5);
    place(world, surface, "pump", 4.5, 3.5);
    world.write_fluid(
        tank,
        0,
        &FluidContents {
            name: "water".into(),
            amount: 5000.0,
            temperature: 15.0,
        },
    );
    let lone = place(world, surface, "pipe", 7.5, 3.5);
    world.write_fluid(
        lone,
        0,
        &FluidContents {
            name: "steam".into(),
            amount: 40.0,
            temperature: 165.0,
        },
    );
    let thruster = place(world, surface, "thruster", 6.5, 5.5);
    world.write_fluid(
        thruster,
        0,
        &FluidContents {
            name: "thruster-fuel".into(),
            amount: 300.0,
            temperature: 15.0,
        },
    );

    // -- Row 7: circuits and logistics ------------------------------------
    let constant = place(world, surface, "constant-combinator", 1.5, 7.5);
    world.set_control_behavior(
        constant,
        &ControlBehavior {
            sections: vec![SignalSection {
                group: None,
                active: true,
                filters: vec![SignalFilter {
                    signal: SignalId::item("iron-plate"),
                    quality: NORMAL_QUALITY.into(),
                    count: 10,
                }],
            }],
            ..Default::default()
        },
    );
    let lamp = place(world, surface, "small-lamp", 2.5, 7.5);
    world.set_control_behavior(
        lamp,
        &ControlBehavior {
            circuit_enabled: true,
            circuit_condition: Some(CircuitCondition {
                first: Some(SignalId::item("iron-plate")),
                comparator: Comparator::Greater,
                second: None,
                constant: 5,
            }),
            parameters: BTreeMap::from([("use_colors".to_string(), "true".to_string())]),
            ..Default::default()
        },
    );
    let decider = place(world, surface, "decider-combinator", 3.5, 7.5);
    world.set_control_behavior(
        decider,
        &ControlBehavior {
            circuit_condition: Some(CircuitCondition {
                first: Some(SignalId::virtual_signal("signal-A")),
                comparator: Comparator::LessOrEqual,
                second: Some(SignalId::item("iron-plate")),
                constant: 0,
            }),
            parameters: BTreeMap::from([("output".to_string(), "signal-check".to_string())]),
            ..Default::default()
        },
    );
    let idle_lamp = place(world, surface, "small-lamp", 5.5, 7.5);
    world.set_active(idle_lamp, false);

    world.connect_wire(constant, WireConnector::red(0), lamp, WireConnector::red(0));
    world.connect_wire(constant, WireConnector::red(0), decider, WireConnector::red(0));
    world.connect_wire(decider, WireConnector::green(1), idle_lamp, WireConnector::green(0));

    let requester = place(world, surface, "requester-chest", 7.5, 7.5);
    world.set_logistic_requests(
        requester,
        &[LogisticRequest {
            section: 0,
            item: "iron-gear-wheel".into(),
            quality: NORMAL_QUALITY.into(),
            min: 50,
            max: None,
        }],
    );
    world.insert_items(requester, InventoryKind::Main, &ItemStack::new("iron-gear-wheel", 25));

    // -- Ground -----------------------------------------------------------
    world.place_ground_item(surface, Position::new(8.25, 8.5), &ItemStack::new("coal", 5));
    world.place_ground_item(surface, Position::new(2.25, 8.5), &ItemStack::new("stone", 2));

    surface
}

// ===========================================================================
// Records
// ===========================================================================

/// A bare record with a unit-number stable id.
pub fn make_record(stable: u64, name: &str) -> EntityRecord {
    EntityRecord {
        stable_id: StableId::from_unit_number(stable),
        unit_number: Some(stable),
        name: name.to_string(),
        category: EntityCategory::Other,
        position: Position::new(stable as f64 + 0.5, 0.5),
        direction: Direction::NORTH,
        orientation: None,
        health: 100.0,
        quality: NORMAL_QUALITY.to_string(),
        inventories: Vec::new(),
        fluids: Vec::new(),
        specific: SpecificData::None,
        wires: Vec::new(),
        control: None,
        filters: Vec::new(),
        logistic_requests: Vec::new(),
        tags: BTreeMap::new(),
    }
}

// ===========================================================================
// Instances
// ===========================================================================

/// Advance the world and the instance one tick at a time until no job is
/// left. Returns the number of ticks taken.
pub fn tick_until_idle(instance: &mut Instance<MemoryWorld>) -> usize {
    let mut ticks = 0;
    while !instance.registry().scheduler.is_idle() {
        instance.world_mut().advance(1);
        instance.on_tick();
        ticks += 1;
        assert!(ticks < 100_000, "jobs never finished");
    }
    ticks
}
