//! An in-memory [`World`] for tests, demos and benchmarks.
//!
//! Small but faithful where transfers are sensitive: unit numbers are only
//! issued to some prototypes, pipes join into fluid segments by tile
//! adjacency, some fluid boxes report their segment's capacity and others
//! only their own, belt lanes have four discrete slots, and deliveries can
//! be left stuck in flight. Every entity is one tile in size.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use slotmap::SlotMap;

use crate::category::EntityCategory;
use crate::fixed::{Fixed64, Ticks};
use crate::id::{EntityHandle, SurfaceId};
use crate::model::{
    BeltItem, ControlBehavior, Direction, EntityFilter, FluidContents, InventoryKind,
    InventoryRecord, ItemStack, LogisticRequest, NORMAL_QUALITY, Position, RecipeState, Schedule,
    SplitterSettings, TileRecord, WireConnector,
};
use crate::world::{
    DeliveryFlush, EntitySpec, EntityView, FluidBoxView, PlatformInfo, WireLink, World, WorldError,
};

/// Items per inventory slot, for every item.
pub const STACK_SIZE: u32 = 100;

/// Prototype name of the control hub every platform is created with.
pub const HUB_NAME: &str = "space-platform-hub";

/// Where the hub is placed on a new platform.
pub const HUB_POSITION: (f64, f64) = (0.5, 0.5);

/// Discrete item slots along a belt lane.
const LANE_SLOTS: [f64; 4] = [0.0, 0.25, 0.5, 0.75];

// ===========================================================================
// Prototypes
// ===========================================================================

#[derive(Debug, Clone, Copy)]
struct FluidProto {
    capacity: f64,
    segmented: bool,
    /// Whether the box reports the whole segment's capacity or only its own.
    reports_segment: bool,
}

#[derive(Debug, Clone, Copy)]
struct Prototype {
    category: EntityCategory,
    unit_number: bool,
    inventories: &'static [(InventoryKind, usize)],
    fluid: Option<FluidProto>,
    lanes: usize,
    holds: bool,
    crafts: bool,
}

fn prototype(name: &str) -> Option<Prototype> {
    use EntityCategory as C;
    use InventoryKind as K;

    let base = |category| Prototype {
        category,
        unit_number: true,
        inventories: &[],
        fluid: None,
        lanes: 0,
        holds: false,
        crafts: false,
    };
    let pipe = FluidProto {
        capacity: 100.0,
        segmented: true,
        reports_segment: true,
    };
    let local = FluidProto {
        capacity: 100.0,
        segmented: true,
        reports_segment: false,
    };

    let p = match name {
        HUB_NAME => Prototype {
            inventories: &[(K::Main, 60)],
            ..base(C::SpacePlatformHub)
        },
        "iron-chest" => Prototype {
            inventories: &[(K::Main, 32)],
            ..base(C::Container)
        },
        "steel-chest" => Prototype {
            inventories: &[(K::Main, 48)],
            ..base(C::Container)
        },
        "requester-chest" => Prototype {
            inventories: &[(K::Main, 30)],
            ..base(C::LogisticContainer)
        },
        "cargo-bay" => base(C::CargoBay),
        "inserter" | "fast-inserter" => Prototype {
            holds: true,
            ..base(C::Inserter)
        },
        "transport-belt" => Prototype {
            lanes: 2,
            ..base(C::TransportBelt)
        },
        "underground-belt" => Prototype {
            lanes: 2,
            ..base(C::UndergroundBelt)
        },
        "splitter" => Prototype {
            lanes: 2,
            ..base(C::Splitter)
        },
        "assembling-machine-1" | "assembling-machine-2" => Prototype {
            inventories: &[(K::Input, 6), (K::Output, 2), (K::Modules, 2)],
            crafts: true,
            ..base(C::AssemblingMachine)
        },
        "electric-furnace" => Prototype {
            inventories: &[(K::Input, 1), (K::Output, 1), (K::Modules, 2)],
            crafts: true,
            ..base(C::Furnace)
        },
        "crusher" => Prototype {
            inventories: &[(K::Input, 1), (K::Output, 2)],
            crafts: true,
            ..base(C::Crusher)
        },
        "chemical-plant" => Prototype {
            inventories: &[(K::Input, 4), (K::Output, 2)],
            fluid: Some(local),
            crafts: true,
            ..base(C::AssemblingMachine)
        },
        "pipe" => Prototype {
            unit_number: false,
            fluid: Some(pipe),
            ..base(C::Pipe)
        },
        "pipe-to-ground" => Prototype {
            unit_number: false,
            fluid: Some(pipe),
            ..base(C::PipeToGround)
        },
        "pump" => Prototype {
            fluid: Some(local),
            ..base(C::Pump)
        },
        "storage-tank" => Prototype {
            fluid: Some(FluidProto {
                capacity: 25_000.0,
                ..pipe
            }),
            ..base(C::StorageTank)
        },
        "thruster" => Prototype {
            fluid: Some(FluidProto {
                capacity: 1000.0,
                segmented: false,
                reports_segment: false,
            }),
            ..base(C::Thruster)
        },
        "asteroid-collector" => Prototype {
            inventories: &[(K::Main, 3)],
            ..base(C::AsteroidCollector)
        },
        "gun-turret" => Prototype {
            inventories: &[(K::Ammo, 10)],
            ..base(C::Turret)
        },
        "solar-panel" => base(C::SolarPanel),
        "accumulator" => base(C::Accumulator),
        "medium-electric-pole" => base(C::ElectricPole),
        "radar" => base(C::Radar),
        "constant-combinator" => base(C::ConstantCombinator),
        "arithmetic-combinator" => base(C::ArithmeticCombinator),
        "decider-combinator" => base(C::DeciderCombinator),
        "selector-combinator" => base(C::SelectorCombinator),
        "small-lamp" => Prototype {
            unit_number: false,
            ..base(C::Lamp)
        },
        "stone-wall" => Prototype {
            unit_number: false,
            ..base(C::Wall)
        },
        _ => return None,
    };
    Some(p)
}

// ===========================================================================
// State
// ===========================================================================

#[derive(Debug, Clone)]
struct MemEntity {
    surface: SurfaceId,
    name: String,
    proto: Prototype,
    /// Creation order within the world; used to name fluid segments.
    serial: u64,
    unit_number: Option<u64>,
    position: Position,
    direction: Direction,
    orientation: Option<Fixed64>,
    health: f64,
    quality: String,
    active: bool,
    inventories: Vec<(InventoryKind, Vec<Option<ItemStack>>)>,
    fluid: Option<FluidContents>,
    lanes: Vec<Vec<BeltItem>>,
    io_type: Option<String>,
    splitter: Option<SplitterSettings>,
    held: Option<ItemStack>,
    recipe: Option<RecipeState>,
    bar: Option<u32>,
    control: Option<ControlBehavior>,
    filters: Vec<EntityFilter>,
    requests: Vec<LogisticRequest>,
    tags: BTreeMap<String, String>,
}

impl MemEntity {
    /// Merge into partial stacks first, then fill empty slots.
    fn insert(&mut self, kind: InventoryKind, stack: &ItemStack) -> u32 {
        let Some((_, slots)) = self.inventories.iter_mut().find(|(k, _)| *k == kind) else {
            return 0;
        };
        let mut remaining = stack.count;
        for slot in slots.iter_mut().flatten() {
            if remaining == 0 {
                break;
            }
            if slot.same_kind(stack) && slot.count < STACK_SIZE {
                let moved = remaining.min(STACK_SIZE - slot.count);
                slot.count += moved;
                remaining -= moved;
            }
        }
        for slot in slots.iter_mut().filter(|s| s.is_none()) {
            if remaining == 0 {
                break;
            }
            let moved = remaining.min(STACK_SIZE);
            *slot = Some(ItemStack {
                count: moved,
                ..stack.clone()
            });
            remaining -= moved;
        }
        stack.count - remaining
    }

    fn tile(&self) -> (i32, i32) {
        self.position.tile()
    }
}

#[derive(Debug, Default)]
struct MemSurface {
    tiles: BTreeMap<(i32, i32), String>,
    /// Entities in creation order.
    entities: Vec<EntityHandle>,
    occupied: BTreeMap<(i32, i32), EntityHandle>,
    ground: Vec<(Position, ItemStack)>,
    hub: Option<EntityHandle>,
}

#[derive(Debug)]
struct PendingDelivery {
    stack: ItemStack,
    /// Never lands, however often it is flushed.
    stuck: bool,
}

#[derive(Debug)]
struct MemPlatform {
    force: String,
    surface: SurfaceId,
    schedule: Option<Schedule>,
    paused: bool,
    hidden: bool,
    deliveries: Vec<PendingDelivery>,
}

type WireKey = (EntityHandle, WireConnector, EntityHandle, WireConnector);

#[derive(Debug)]
pub struct MemoryWorld {
    tick: Ticks,
    game_version: String,
    platforms: BTreeMap<String, MemPlatform>,
    surfaces: SlotMap<SurfaceId, MemSurface>,
    entities: SlotMap<EntityHandle, MemEntity>,
    /// Undirected; each wire stored once with its lower end first.
    wires: BTreeSet<WireKey>,
    next_serial: u64,
    next_unit_number: u64,
    reverse_iteration: bool,
    reject_hidden_writes: bool,
    reject_pause_writes: bool,
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self {
            tick: 0,
            game_version: "2.0.28".to_string(),
            platforms: BTreeMap::new(),
            surfaces: SlotMap::with_key(),
            entities: SlotMap::with_key(),
            wires: BTreeSet::new(),
            next_serial: 0,
            next_unit_number: 1,
            reverse_iteration: false,
            reject_hidden_writes: false,
            reject_pause_writes: false,
        }
    }

    /// Advance the simulation clock.
    pub fn advance(&mut self, ticks: Ticks) {
        self.tick += ticks;
    }

    /// Report surface entities newest first instead of oldest first.
    pub fn set_reverse_iteration(&mut self, reverse: bool) {
        self.reverse_iteration = reverse;
    }

    /// Make `set_platform_hidden` and/or `set_platform_paused` fail, as a
    /// simulation that refuses the change would.
    pub fn reject_platform_writes(&mut self, hidden: bool, paused: bool) {
        self.reject_hidden_writes = hidden;
        self.reject_pause_writes = paused;
    }

    /// Remove an entity and every wire attached to it.
    pub fn destroy_entity(&mut self, entity: EntityHandle) -> bool {
        let Some(removed) = self.entities.remove(entity) else {
            return false;
        };
        if let Some(surface) = self.surfaces.get_mut(removed.surface) {
            surface.entities.retain(|&h| h != entity);
            surface.occupied.remove(&removed.tile());
            if surface.hub == Some(entity) {
                surface.hub = None;
            }
        }
        self.wires.retain(|(a, _, b, _)| *a != entity && *b != entity);
        true
    }

    /// Queue an item delivery to the platform's hub. A stuck delivery never
    /// lands.
    pub fn add_pending_delivery(&mut self, platform: &str, stack: ItemStack, stuck: bool) {
        if let Some(p) = self.platforms.get_mut(platform) {
            p.deliveries.push(PendingDelivery { stack, stuck });
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn spawn(
        &mut self,
        surface: SurfaceId,
        proto: Prototype,
        spec: &EntitySpec<'_>,
    ) -> Result<EntityHandle, WorldError> {
        let tile = spec.position.tile();
        let placement = |reason: &str| WorldError::Placement {
            name: spec.name.to_string(),
            x: tile.0,
            y: tile.1,
            reason: reason.to_string(),
        };
        let Some(surf) = self.surfaces.get(surface) else {
            return Err(WorldError::SurfaceInvalid);
        };
        if proto.category != EntityCategory::SpacePlatformHub && !surf.tiles.contains_key(&tile) {
            return Err(placement("no tile"));
        }
        if surf.occupied.contains_key(&tile) {
            return Err(placement("occupied"));
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        let unit_number = proto.unit_number.then(|| {
            let n = self.next_unit_number;
            self.next_unit_number += 1;
            n
        });
        let io_type = match proto.category {
            EntityCategory::UndergroundBelt => Some(spec.variant.unwrap_or("input").to_string()),
            _ => None,
        };
        let entity = MemEntity {
            surface,
            name: spec.name.to_string(),
            proto,
            serial,
            unit_number,
            position: spec.position,
            direction: spec.direction,
            orientation: spec.orientation,
            health: spec.health,
            quality: spec.quality.to_string(),
            active: true,
            inventories: proto
                .inventories
                .iter()
                .map(|&(kind, slots)| (kind, vec![None; slots]))
                .collect(),
            fluid: None,
            lanes: vec![Vec::new(); proto.lanes],
            io_type,
            splitter: None,
            held: None,
            recipe: None,
            bar: None,
            control: None,
            filters: Vec::new(),
            requests: Vec::new(),
            tags: BTreeMap::new(),
        };
        let handle = self.entities.insert(entity);
        if let Some(surf) = self.surfaces.get_mut(surface) {
            surf.entities.push(handle);
            surf.occupied.insert(tile, handle);
        }
        Ok(handle)
    }

    /// Every segmented fluid box connected to `entity` through adjacent
    /// tiles, `entity` included.
    fn segment_members(&self, entity: EntityHandle) -> Vec<EntityHandle> {
        let Some(start) = self.entities.get(entity) else {
            return Vec::new();
        };
        let Some(surface) = self.surfaces.get(start.surface) else {
            return Vec::new();
        };
        let segmented = |h: EntityHandle| {
            self.entities
                .get(h)
                .and_then(|e| e.proto.fluid)
                .is_some_and(|f| f.segmented)
        };
        let mut seen = BTreeSet::from([entity]);
        let mut queue = VecDeque::from([entity]);
        let mut members = Vec::new();
        while let Some(current) = queue.pop_front() {
            members.push(current);
            let Some(e) = self.entities.get(current) else {
                continue;
            };
            let (x, y) = e.tile();
            for neighbor in [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)] {
                if let Some(&h) = surface.occupied.get(&neighbor) {
                    if segmented(h) && seen.insert(h) {
                        queue.push_back(h);
                    }
                }
            }
        }
        members
    }

    fn local_capacity(&self, entity: EntityHandle) -> f64 {
        self.entities
            .get(entity)
            .and_then(|e| e.proto.fluid)
            .map(|f| f.capacity)
            .unwrap_or(0.0)
    }
}

fn is_container(category: EntityCategory) -> bool {
    matches!(category, EntityCategory::Container | EntityCategory::LogisticContainer)
}

fn is_splitter(category: EntityCategory) -> bool {
    matches!(category, EntityCategory::Splitter | EntityCategory::LaneSplitter)
}

// ===========================================================================
// World implementation
// ===========================================================================

impl World for MemoryWorld {
    fn game_version(&self) -> String {
        self.game_version.clone()
    }

    fn current_tick(&self) -> Ticks {
        self.tick
    }

    // -- Platforms --------------------------------------------------------

    fn platform(&self, name: &str) -> Option<PlatformInfo> {
        self.platforms.get(name).map(|p| PlatformInfo {
            name: name.to_string(),
            force: p.force.clone(),
            surface: p.surface,
            schedule: p.schedule.clone(),
            paused: p.paused,
            hidden: p.hidden,
        })
    }

    fn create_platform(&mut self, name: &str, force: &str) -> Result<SurfaceId, WorldError> {
        if self.platforms.contains_key(name) {
            return Err(WorldError::PlatformExists(name.to_string()));
        }
        let surface = self.surfaces.insert(MemSurface::default());
        let hub_proto = prototype(HUB_NAME)
            .ok_or_else(|| WorldError::UnknownPrototype(HUB_NAME.to_string()))?;
        let hub = self.spawn(
            surface,
            hub_proto,
            &EntitySpec {
                name: HUB_NAME,
                position: Position::new(HUB_POSITION.0, HUB_POSITION.1),
                direction: Direction::NORTH,
                orientation: None,
                quality: NORMAL_QUALITY,
                health: 1000.0,
                variant: None,
            },
        )?;
        if let Some(surf) = self.surfaces.get_mut(surface) {
            surf.hub = Some(hub);
        }
        self.platforms.insert(
            name.to_string(),
            MemPlatform {
                force: force.to_string(),
                surface,
                schedule: None,
                paused: false,
                hidden: false,
                deliveries: Vec::new(),
            },
        );
        Ok(surface)
    }

    fn delete_platform(&mut self, name: &str) -> Result<(), WorldError> {
        let platform = self
            .platforms
            .remove(name)
            .ok_or_else(|| WorldError::PlatformNotFound(name.to_string()))?;
        if let Some(surface) = self.surfaces.remove(platform.surface) {
            for handle in surface.entities {
                self.entities.remove(handle);
            }
        }
        let entities = &self.entities;
        self.wires
            .retain(|(a, _, b, _)| entities.contains_key(*a) && entities.contains_key(*b));
        Ok(())
    }

    fn set_platform_hidden(&mut self, name: &str, hidden: bool) -> Result<(), WorldError> {
        if self.reject_hidden_writes {
            return Err(WorldError::Rejected(name.to_string()));
        }
        let p = self
            .platforms
            .get_mut(name)
            .ok_or_else(|| WorldError::PlatformNotFound(name.to_string()))?;
        p.hidden = hidden;
        Ok(())
    }

    fn set_platform_schedule(
        &mut self,
        name: &str,
        schedule: Option<Schedule>,
    ) -> Result<(), WorldError> {
        let p = self
            .platforms
            .get_mut(name)
            .ok_or_else(|| WorldError::PlatformNotFound(name.to_string()))?;
        p.schedule = schedule;
        Ok(())
    }

    fn set_platform_paused(&mut self, name: &str, paused: bool) -> Result<(), WorldError> {
        if self.reject_pause_writes {
            return Err(WorldError::Rejected(name.to_string()));
        }
        let p = self
            .platforms
            .get_mut(name)
            .ok_or_else(|| WorldError::PlatformNotFound(name.to_string()))?;
        p.paused = paused;
        Ok(())
    }

    fn flush_deliveries(&mut self, name: &str) -> DeliveryFlush {
        let Some(platform) = self.platforms.get_mut(name) else {
            return DeliveryFlush::default();
        };
        let hub = self.surfaces.get(platform.surface).and_then(|s| s.hub);
        let mut flush = DeliveryFlush::default();
        let mut still_pending = Vec::new();
        for delivery in platform.deliveries.drain(..) {
            let landed = !delivery.stuck
                && hub
                    .and_then(|h| self.entities.get_mut(h))
                    .is_some_and(|e| e.insert(InventoryKind::Main, &delivery.stack) > 0);
            if landed {
                flush.resolved += 1;
            } else {
                still_pending.push(delivery);
            }
        }
        flush.pending = still_pending.len() as u32;
        platform.deliveries = still_pending;
        flush
    }

    // -- Surface queries --------------------------------------------------

    fn surface_valid(&self, surface: SurfaceId) -> bool {
        self.surfaces.contains_key(surface)
    }

    fn entities(&self, surface: SurfaceId) -> Vec<EntityHandle> {
        let Some(surf) = self.surfaces.get(surface) else {
            return Vec::new();
        };
        let mut handles = surf.entities.clone();
        if self.reverse_iteration {
            handles.reverse();
        }
        handles
    }

    fn hub(&self, surface: SurfaceId) -> Option<EntityHandle> {
        self.surfaces.get(surface).and_then(|s| s.hub)
    }

    fn tiles(&self, surface: SurfaceId) -> Vec<TileRecord> {
        self.surfaces
            .get(surface)
            .map(|s| {
                s.tiles
                    .iter()
                    .map(|(&(x, y), name)| TileRecord {
                        name: name.clone(),
                        x,
                        y,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn ground_items(&self, surface: SurfaceId) -> Vec<(Position, ItemStack)> {
        let Some(surf) = self.surfaces.get(surface) else {
            return Vec::new();
        };
        let mut items = surf.ground.clone();
        if self.reverse_iteration {
            items.reverse();
        }
        items
    }

    // -- Entity queries ---------------------------------------------------

    fn entity(&self, entity: EntityHandle) -> Option<EntityView> {
        self.entities.get(entity).map(|e| EntityView {
            handle: entity,
            name: e.name.clone(),
            category: e.proto.category,
            position: e.position,
            direction: e.direction,
            orientation: e.orientation,
            health: e.health,
            quality: e.quality.clone(),
            unit_number: e.unit_number,
            active: e.active,
        })
    }

    fn inventories(&self, entity: EntityHandle) -> Vec<InventoryRecord> {
        let Some(e) = self.entities.get(entity) else {
            return Vec::new();
        };
        e.inventories
            .iter()
            .map(|(kind, slots)| InventoryRecord {
                kind: *kind,
                stacks: slots.iter().flatten().cloned().collect(),
            })
            .collect()
    }

    fn fluid_boxes(&self, entity: EntityHandle) -> Vec<FluidBoxView> {
        let Some(e) = self.entities.get(entity) else {
            return Vec::new();
        };
        let Some(proto) = e.proto.fluid else {
            return Vec::new();
        };
        let (capacity, segment) = if proto.segmented {
            let members = self.segment_members(entity);
            let total: f64 = members.iter().map(|&h| self.local_capacity(h)).sum();
            let first = members
                .iter()
                .filter_map(|&h| self.entities.get(h))
                .map(|m| m.serial)
                .min()
                .unwrap_or(e.serial);
            let capacity = if proto.reports_segment { total } else { proto.capacity };
            (capacity, Some(first << 4))
        } else {
            (proto.capacity, None)
        };
        vec![FluidBoxView {
            index: 0,
            contents: e.fluid.clone().filter(|c| c.amount > 0.0),
            capacity,
            segment,
        }]
    }

    fn belt_lanes(&self, entity: EntityHandle) -> Vec<Vec<BeltItem>> {
        self.entities
            .get(entity)
            .map(|e| e.lanes.clone())
            .unwrap_or_default()
    }

    fn belt_io_type(&self, entity: EntityHandle) -> Option<String> {
        self.entities.get(entity).and_then(|e| e.io_type.clone())
    }

    fn splitter_settings(&self, entity: EntityHandle) -> Option<SplitterSettings> {
        self.entities.get(entity).and_then(|e| e.splitter.clone())
    }

    fn held_stack(&self, entity: EntityHandle) -> Option<ItemStack> {
        self.entities.get(entity).and_then(|e| e.held.clone())
    }

    fn recipe_state(&self, entity: EntityHandle) -> Option<RecipeState> {
        self.entities.get(entity).and_then(|e| e.recipe.clone())
    }

    fn container_bar(&self, entity: EntityHandle) -> Option<u32> {
        self.entities.get(entity).and_then(|e| e.bar)
    }

    fn wires(&self, entity: EntityHandle) -> Vec<WireLink> {
        self.wires
            .iter()
            .filter_map(|&(a, ca, b, cb)| {
                if a == entity {
                    Some(WireLink {
                        connector: ca,
                        target: b,
                        target_connector: cb,
                    })
                } else if b == entity {
                    Some(WireLink {
                        connector: cb,
                        target: a,
                        target_connector: ca,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    fn control_behavior(&self, entity: EntityHandle) -> Option<ControlBehavior> {
        self.entities.get(entity).and_then(|e| e.control.clone())
    }

    fn filters(&self, entity: EntityHandle) -> Vec<EntityFilter> {
        self.entities
            .get(entity)
            .map(|e| e.filters.clone())
            .unwrap_or_default()
    }

    fn logistic_requests(&self, entity: EntityHandle) -> Vec<LogisticRequest> {
        self.entities
            .get(entity)
            .map(|e| e.requests.clone())
            .unwrap_or_default()
    }

    fn tags(&self, entity: EntityHandle) -> BTreeMap<String, String> {
        self.entities
            .get(entity)
            .map(|e| e.tags.clone())
            .unwrap_or_default()
    }

    // -- Mutation ---------------------------------------------------------

    fn set_tiles(&mut self, surface: SurfaceId, tiles: &[TileRecord]) -> Result<(), WorldError> {
        let surf = self.surfaces.get_mut(surface).ok_or(WorldError::SurfaceInvalid)?;
        for tile in tiles {
            surf.tiles.insert((tile.x, tile.y), tile.name.clone());
        }
        Ok(())
    }

    fn create_entity(
        &mut self,
        surface: SurfaceId,
        spec: &EntitySpec<'_>,
    ) -> Result<EntityHandle, WorldError> {
        if !self.surfaces.contains_key(surface) {
            return Err(WorldError::SurfaceInvalid);
        }
        let proto = prototype(spec.name)
            .ok_or_else(|| WorldError::UnknownPrototype(spec.name.to_string()))?;
        if proto.category == EntityCategory::SpacePlatformHub {
            let (x, y) = spec.position.tile();
            return Err(WorldError::Placement {
                name: spec.name.to_string(),
                x,
                y,
                reason: "a platform has exactly one hub".to_string(),
            });
        }
        self.spawn(surface, proto, spec)
    }

    fn set_active(&mut self, entity: EntityHandle, active: bool) -> bool {
        match self.entities.get_mut(entity) {
            Some(e) => {
                e.active = active;
                true
            }
            None => false,
        }
    }

    fn insert_items(
        &mut self,
        entity: EntityHandle,
        kind: InventoryKind,
        stack: &ItemStack,
    ) -> u32 {
        self.entities
            .get_mut(entity)
            .map(|e| e.insert(kind, stack))
            .unwrap_or(0)
    }

    fn write_fluid(&mut self, entity: EntityHandle, index: u32, contents: &FluidContents) -> f64 {
        if index != 0 {
            return 0.0;
        }
        let Some(view) = self.fluid_boxes(entity).into_iter().next() else {
            return 0.0;
        };
        let accepted = contents.amount.clamp(0.0, view.capacity);
        let share = |amount: f64| {
            (amount > 0.0).then(|| FluidContents {
                name: contents.name.clone(),
                amount,
                temperature: contents.temperature,
            })
        };
        if view.segment.is_some() {
            let members: Vec<(EntityHandle, f64)> = self
                .segment_members(entity)
                .into_iter()
                .map(|h| (h, self.local_capacity(h)))
                .collect();
            let total: f64 = members.iter().map(|(_, c)| c).sum();
            for (h, local) in members {
                if let Some(member) = self.entities.get_mut(h) {
                    member.fluid = share(accepted * local / total);
                }
            }
        } else if let Some(e) = self.entities.get_mut(entity) {
            e.fluid = share(accepted);
        }
        accepted
    }

    fn belt_insert_at(
        &mut self,
        entity: EntityHandle,
        lane: usize,
        position: Fixed64,
        stack: &ItemStack,
    ) -> bool {
        let gap = Fixed64::from_num(0.25);
        let Some(items) = self.entities.get_mut(entity).and_then(|e| e.lanes.get_mut(lane)) else {
            return false;
        };
        if position < Fixed64::ZERO || position >= Fixed64::ONE {
            return false;
        }
        if items.iter().any(|item| (item.position - position).abs() < gap) {
            return false;
        }
        items.push(BeltItem {
            position,
            stack: stack.clone(),
        });
        items.sort_by_key(|item| item.position);
        true
    }

    fn belt_insert_at_back(
        &mut self,
        entity: EntityHandle,
        lane: usize,
        stack: &ItemStack,
    ) -> bool {
        LANE_SLOTS
            .iter()
            .rev()
            .any(|&slot| self.belt_insert_at(entity, lane, Fixed64::from_num(slot), stack))
    }

    fn set_held_stack(&mut self, entity: EntityHandle, stack: &ItemStack) -> bool {
        match self.entities.get_mut(entity) {
            Some(e) if e.proto.holds => {
                e.held = Some(stack.clone());
                true
            }
            _ => false,
        }
    }

    fn set_recipe_state(&mut self, entity: EntityHandle, state: &RecipeState) -> bool {
        match self.entities.get_mut(entity) {
            Some(e) if e.proto.crafts => {
                e.recipe = Some(state.clone());
                true
            }
            _ => false,
        }
    }

    fn set_container_bar(&mut self, entity: EntityHandle, bar: Option<u32>) -> bool {
        match self.entities.get_mut(entity) {
            Some(e) if is_container(e.proto.category) => {
                e.bar = bar;
                true
            }
            _ => false,
        }
    }

    fn set_splitter_settings(&mut self, entity: EntityHandle, settings: &SplitterSettings) -> bool {
        match self.entities.get_mut(entity) {
            Some(e) if is_splitter(e.proto.category) => {
                e.splitter = Some(settings.clone());
                true
            }
            _ => false,
        }
    }

    fn connect_wire(
        &mut self,
        entity: EntityHandle,
        connector: WireConnector,
        target: EntityHandle,
        target_connector: WireConnector,
    ) -> bool {
        if entity == target {
            return false;
        }
        let (Some(a), Some(b)) = (self.entities.get(entity), self.entities.get(target)) else {
            return false;
        };
        if a.surface != b.surface {
            return false;
        }
        let key = if (entity, connector) <= (target, target_connector) {
            (entity, connector, target, target_connector)
        } else {
            (target, target_connector, entity, connector)
        };
        self.wires.insert(key);
        true
    }

    fn set_control_behavior(&mut self, entity: EntityHandle, behavior: &ControlBehavior) -> bool {
        match self.entities.get_mut(entity) {
            Some(e) => {
                e.control = Some(behavior.clone());
                true
            }
            None => false,
        }
    }

    fn set_filters(&mut self, entity: EntityHandle, filters: &[EntityFilter]) -> bool {
        match self.entities.get_mut(entity) {
            Some(e) => {
                e.filters = filters.to_vec();
                true
            }
            None => false,
        }
    }

    fn set_logistic_requests(
        &mut self,
        entity: EntityHandle,
        requests: &[LogisticRequest],
    ) -> bool {
        match self.entities.get_mut(entity) {
            Some(e) if e.proto.category == EntityCategory::LogisticContainer => {
                e.requests = requests.to_vec();
                true
            }
            _ => false,
        }
    }

    fn set_tags(&mut self, entity: EntityHandle, tags: &BTreeMap<String, String>) -> bool {
        match self.entities.get_mut(entity) {
            Some(e) => {
                e.tags = tags.clone();
                true
            }
            None => false,
        }
    }

    fn place_ground_item(
        &mut self,
        surface: SurfaceId,
        position: Position,
        stack: &ItemStack,
    ) -> bool {
        match self.surfaces.get_mut(surface) {
            Some(surf) if surf.tiles.contains_key(&position.tile()) => {
                surf.ground.push((position, stack.clone()));
                true
            }
            _ => false,
        }
    }
}
