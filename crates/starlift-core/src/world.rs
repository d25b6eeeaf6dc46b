//! The seam between the transfer engine and the simulation it runs inside.
//!
//! The engine never touches simulation internals directly: everything it
//! reads or writes goes through the object-safe [`World`] trait. Queries on
//! an entity that no longer exists return empty values (`None`, empty
//! vectors, `false`) rather than errors, so a scan can skip entities that
//! become invalid mid-way.

use std::collections::BTreeMap;

use crate::category::EntityCategory;
use crate::fixed::{Fixed64, Ticks};
use crate::id::{EntityHandle, SurfaceId};
use crate::model::{
    BeltItem, ControlBehavior, Direction, EntityFilter, FluidContents, InventoryKind,
    InventoryRecord, ItemStack, LogisticRequest, Position, RecipeState, Schedule,
    SplitterSettings, TileRecord, WireConnector,
};

/// Errors reported by the simulation for structural operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("platform '{0}' not found")]
    PlatformNotFound(String),
    #[error("platform '{0}' already exists")]
    PlatformExists(String),
    #[error("platform '{0}' rejected the change")]
    Rejected(String),
    #[error("surface is no longer valid")]
    SurfaceInvalid,
    #[error("unknown prototype '{0}'")]
    UnknownPrototype(String),
    #[error("cannot place '{name}' at ({x}, {y}): {reason}")]
    Placement {
        name: String,
        x: i32,
        y: i32,
        reason: String,
    },
}

/// Platform-level state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub name: String,
    pub force: String,
    pub surface: SurfaceId,
    pub schedule: Option<Schedule>,
    pub paused: bool,
    pub hidden: bool,
}

/// Common fields of a live entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    pub handle: EntityHandle,
    pub name: String,
    pub category: EntityCategory,
    pub position: Position,
    pub direction: Direction,
    pub orientation: Option<Fixed64>,
    pub health: f64,
    pub quality: String,
    /// Durable id the engine assigned, if it assigns one to this kind.
    pub unit_number: Option<u64>,
    pub active: bool,
}

/// One fluid box of a live entity.
#[derive(Debug, Clone, PartialEq)]
pub struct FluidBoxView {
    pub index: u32,
    pub contents: Option<FluidContents>,
    /// Capacity as this entity reports it. Some kinds report the whole
    /// segment's capacity, others only their local buffer.
    pub capacity: f64,
    pub segment: Option<u64>,
}

/// A wire as seen from one end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WireLink {
    pub connector: WireConnector,
    pub target: EntityHandle,
    pub target_connector: WireConnector,
}

/// Outcome of one attempt to land in-flight deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryFlush {
    pub resolved: u32,
    pub pending: u32,
}

/// What to build when creating an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySpec<'a> {
    pub name: &'a str,
    pub position: Position,
    pub direction: Direction,
    pub orientation: Option<Fixed64>,
    pub quality: &'a str,
    pub health: f64,
    pub variant: Option<&'a str>,
}

/// Introspection and mutation primitives of a live simulation.
pub trait World {
    /// Engine/mod version string recorded in exported snapshots.
    fn game_version(&self) -> String;

    fn current_tick(&self) -> Ticks;

    // -- Platforms --------------------------------------------------------

    fn platform(&self, name: &str) -> Option<PlatformInfo>;

    /// Create an empty platform. The control hub is created with it.
    fn create_platform(&mut self, name: &str, force: &str) -> Result<SurfaceId, WorldError>;

    fn delete_platform(&mut self, name: &str) -> Result<(), WorldError>;

    fn set_platform_hidden(&mut self, name: &str, hidden: bool) -> Result<(), WorldError>;

    fn set_platform_schedule(&mut self, name: &str, schedule: Option<Schedule>)
    -> Result<(), WorldError>;

    fn set_platform_paused(&mut self, name: &str, paused: bool) -> Result<(), WorldError>;

    /// Force in-flight deliveries between the platform and its surroundings
    /// to land in inventory. Reports how many are still airborne.
    fn flush_deliveries(&mut self, name: &str) -> DeliveryFlush;

    // -- Surface queries --------------------------------------------------

    fn surface_valid(&self, surface: SurfaceId) -> bool;

    /// Entities on the surface in native (unspecified) order.
    fn entities(&self, surface: SurfaceId) -> Vec<EntityHandle>;

    /// The platform's singleton control hub.
    fn hub(&self, surface: SurfaceId) -> Option<EntityHandle>;

    fn tiles(&self, surface: SurfaceId) -> Vec<TileRecord>;

    fn ground_items(&self, surface: SurfaceId) -> Vec<(Position, ItemStack)>;

    // -- Entity queries ---------------------------------------------------

    fn entity(&self, entity: EntityHandle) -> Option<EntityView>;

    fn inventories(&self, entity: EntityHandle) -> Vec<InventoryRecord>;

    fn fluid_boxes(&self, entity: EntityHandle) -> Vec<FluidBoxView>;

    fn belt_lanes(&self, entity: EntityHandle) -> Vec<Vec<BeltItem>>;

    fn belt_io_type(&self, entity: EntityHandle) -> Option<String>;

    fn splitter_settings(&self, entity: EntityHandle) -> Option<SplitterSettings>;

    fn held_stack(&self, entity: EntityHandle) -> Option<ItemStack>;

    fn recipe_state(&self, entity: EntityHandle) -> Option<RecipeState>;

    fn container_bar(&self, entity: EntityHandle) -> Option<u32>;

    fn wires(&self, entity: EntityHandle) -> Vec<WireLink>;

    fn control_behavior(&self, entity: EntityHandle) -> Option<ControlBehavior>;

    fn filters(&self, entity: EntityHandle) -> Vec<EntityFilter>;

    fn logistic_requests(&self, entity: EntityHandle) -> Vec<LogisticRequest>;

    fn tags(&self, entity: EntityHandle) -> BTreeMap<String, String>;

    // -- Mutation ---------------------------------------------------------

    fn set_tiles(&mut self, surface: SurfaceId, tiles: &[TileRecord]) -> Result<(), WorldError>;

    fn create_entity(
        &mut self,
        surface: SurfaceId,
        spec: &EntitySpec<'_>,
    ) -> Result<EntityHandle, WorldError>;

    /// Returns `false` if the entity no longer exists.
    fn set_active(&mut self, entity: EntityHandle, active: bool) -> bool;

    /// Insert up to `stack.count` items. Returns how many were accepted.
    fn insert_items(&mut self, entity: EntityHandle, kind: InventoryKind, stack: &ItemStack) -> u32;

    /// Write fluid through one fluid box. For a box that belongs to a
    /// segment this sets the whole segment's contents, truncated to the
    /// capacity this entity reports. Returns the amount accepted.
    fn write_fluid(&mut self, entity: EntityHandle, index: u32, contents: &FluidContents) -> f64;

    /// Place an item at an exact lane position. `false` if the slot is taken.
    fn belt_insert_at(
        &mut self,
        entity: EntityHandle,
        lane: usize,
        position: Fixed64,
        stack: &ItemStack,
    ) -> bool;

    /// Append an item at the back of a lane. `false` if the lane is full.
    fn belt_insert_at_back(&mut self, entity: EntityHandle, lane: usize, stack: &ItemStack) -> bool;

    fn set_held_stack(&mut self, entity: EntityHandle, stack: &ItemStack) -> bool;

    fn set_recipe_state(&mut self, entity: EntityHandle, state: &RecipeState) -> bool;

    fn set_container_bar(&mut self, entity: EntityHandle, bar: Option<u32>) -> bool;

    fn set_splitter_settings(&mut self, entity: EntityHandle, settings: &SplitterSettings) -> bool;

    fn connect_wire(
        &mut self,
        entity: EntityHandle,
        connector: WireConnector,
        target: EntityHandle,
        target_connector: WireConnector,
    ) -> bool;

    fn set_control_behavior(&mut self, entity: EntityHandle, behavior: &ControlBehavior) -> bool;

    fn set_filters(&mut self, entity: EntityHandle, filters: &[EntityFilter]) -> bool;

    fn set_logistic_requests(&mut self, entity: EntityHandle, requests: &[LogisticRequest]) -> bool;

    fn set_tags(&mut self, entity: EntityHandle, tags: &BTreeMap<String, String>) -> bool;

    fn place_ground_item(&mut self, surface: SurfaceId, position: Position, stack: &ItemStack)
    -> bool;
}
