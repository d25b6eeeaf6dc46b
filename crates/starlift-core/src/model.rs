//! Platform snapshot data model.
//!
//! A [`PlatformSnapshot`] is the root export artifact: platform metadata,
//! the ordered entity and tile records, the pre-lock active flags, and the
//! [`VerificationTotals`] used as ground truth for post-import validation.
//!
//! Every map is a `BTreeMap` and every list has a defined order, so the same
//! platform always serializes to the same bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::category::EntityCategory;
use crate::fixed::{Fixed64, Ticks, f64_to_fixed64, tile_of};
use crate::id::StableId;

/// Snapshot schema version. Carried in every snapshot; no migration exists.
pub const SCHEMA_VERSION: u32 = 1;

/// Default quality tier name.
pub const NORMAL_QUALITY: &str = "normal";

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// A point on a surface in fixed-point tile units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: Fixed64,
    pub y: Fixed64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: f64_to_fixed64(x),
            y: f64_to_fixed64(y),
        }
    }

    /// The integer tile containing this position.
    pub fn tile(&self) -> (i32, i32) {
        (tile_of(self.x), tile_of(self.y))
    }
}

/// One of 16 compass directions (0 = north, 4 = east, 8 = south, 12 = west).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Direction(pub u8);

impl Direction {
    pub const NORTH: Direction = Direction(0);
    pub const EAST: Direction = Direction(4);
    pub const SOUTH: Direction = Direction(8);
    pub const WEST: Direction = Direction(12);
}

// ---------------------------------------------------------------------------
// Items and fluids
// ---------------------------------------------------------------------------

/// A quantity of one item type at one quality tier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemStack {
    pub name: String,
    pub quality: String,
    pub count: u32,
}

impl ItemStack {
    /// A stack of normal quality.
    pub fn new(name: impl Into<String>, count: u32) -> Self {
        Self {
            name: name.into(),
            quality: NORMAL_QUALITY.to_string(),
            count,
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = quality.into();
        self
    }

    /// Whether two stacks hold the same item at the same quality.
    pub fn same_kind(&self, other: &ItemStack) -> bool {
        self.name == other.name && self.quality == other.quality
    }
}

/// Which of an entity's inventories a set of stacks belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InventoryKind {
    Main,
    Input,
    Output,
    Fuel,
    BurntResult,
    Modules,
    Ammo,
    Trash,
}

/// The contents of one inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub kind: InventoryKind,
    pub stacks: Vec<ItemStack>,
}

/// Fluid held in one fluid box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluidContents {
    pub name: String,
    pub amount: f64,
    pub temperature: f64,
}

/// One fluid box of an entity as captured at scan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluidRecord {
    pub index: u32,
    pub contents: FluidContents,
    /// Capacity the source engine reported for this box.
    pub capacity: f64,
    /// Source-side fluid segment this box belonged to, if any.
    pub segment: Option<u64>,
}

/// An item sitting on a belt lane at an exact slot position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeltItem {
    pub position: Fixed64,
    pub stack: ItemStack,
}

// ---------------------------------------------------------------------------
// Wiring and control
// ---------------------------------------------------------------------------

/// Wire colour. Copper wires carry power, red and green carry signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WireKind {
    Red,
    Green,
    Copper,
}

/// A typed connection point on an entity. `index` distinguishes, e.g., a
/// combinator's input (0) from its output (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WireConnector {
    pub kind: WireKind,
    pub index: u8,
}

impl WireConnector {
    pub fn red(index: u8) -> Self {
        Self {
            kind: WireKind::Red,
            index,
        }
    }

    pub fn green(index: u8) -> Self {
        Self {
            kind: WireKind::Green,
            index,
        }
    }

    pub fn copper(index: u8) -> Self {
        Self {
            kind: WireKind::Copper,
            index,
        }
    }
}

/// A wire from one of this entity's connectors to a connector on `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WireConnection {
    pub connector: WireConnector,
    pub target: StableId,
    pub target_connector: WireConnector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Item,
    Fluid,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalId {
    pub kind: SignalKind,
    pub name: String,
}

impl SignalId {
    pub fn item(name: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Item,
            name: name.into(),
        }
    }

    pub fn virtual_signal(name: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Virtual,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    Less,
    LessOrEqual,
    Equal,
    GreaterOrEqual,
    Greater,
    NotEqual,
}

/// `first <comparator> (second | constant)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitCondition {
    pub first: Option<SignalId>,
    pub comparator: Comparator,
    pub second: Option<SignalId>,
    pub constant: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFilter {
    pub signal: SignalId,
    pub quality: String,
    pub count: i32,
}

/// A group of signals a constant combinator or request section emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSection {
    pub group: Option<String>,
    pub active: bool,
    pub filters: Vec<SignalFilter>,
}

/// Circuit-network behaviour of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlBehavior {
    pub circuit_enabled: bool,
    pub circuit_condition: Option<CircuitCondition>,
    pub logistic_condition: Option<CircuitCondition>,
    pub sections: Vec<SignalSection>,
    pub read_contents: bool,
    /// Category-specific switches (read modes, arithmetic operator, ...).
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogisticRequest {
    pub section: u32,
    pub item: String,
    pub quality: String,
    pub min: u32,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub index: u32,
    pub name: String,
    pub quality: Option<String>,
}

// ---------------------------------------------------------------------------
// Category-specific data
// ---------------------------------------------------------------------------

/// Crafting progress of a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeState {
    pub recipe: String,
    pub quality: String,
    pub progress: f64,
    pub productivity_progress: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitterSettings {
    pub input_priority: String,
    pub output_priority: String,
    pub filter: Option<String>,
}

/// Fields only some categories carry. Extracted and restored by the
/// handler registered for the entity's category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum SpecificData {
    #[default]
    None,
    Crafting(RecipeState),
    Belt {
        lanes: Vec<Vec<BeltItem>>,
        io_type: Option<String>,
        splitter: Option<SplitterSettings>,
    },
    Inserter {
        held: Option<ItemStack>,
    },
    Container {
        bar: Option<u32>,
    },
    GroundItem {
        stack: ItemStack,
    },
}

impl SpecificData {
    /// Creation-time variant the entity must be built with (e.g. the
    /// input/output side of an underground belt).
    pub fn creation_variant(&self) -> Option<&str> {
        match self {
            SpecificData::Belt { io_type, .. } => io_type.as_deref(),
            _ => None,
        }
    }

    /// Every item stack this data holds outside of regular inventories.
    pub fn item_stacks(&self) -> Vec<&ItemStack> {
        match self {
            SpecificData::Belt { lanes, .. } => lanes
                .iter()
                .flat_map(|lane| lane.iter().map(|item| &item.stack))
                .collect(),
            SpecificData::Inserter { held: Some(stack) } => vec![stack],
            SpecificData::GroundItem { stack } => vec![stack],
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One simulated object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub stable_id: StableId,
    pub unit_number: Option<u64>,
    pub name: String,
    pub category: EntityCategory,
    pub position: Position,
    pub direction: Direction,
    pub orientation: Option<Fixed64>,
    pub health: f64,
    pub quality: String,
    pub inventories: Vec<InventoryRecord>,
    pub fluids: Vec<FluidRecord>,
    pub specific: SpecificData,
    pub wires: Vec<WireConnection>,
    pub control: Option<ControlBehavior>,
    pub filters: Vec<EntityFilter>,
    pub logistic_requests: Vec<LogisticRequest>,
    pub tags: BTreeMap<String, String>,
}

impl EntityRecord {
    /// Total-order sort key: stable id, then name, position, direction.
    pub fn sort_key(&self) -> (StableId, &str, Position, Direction) {
        (self.stable_id, self.name.as_str(), self.position, self.direction)
    }

    /// Every item stack the record carries, regardless of where it sits.
    pub fn all_item_stacks(&self) -> impl Iterator<Item = &ItemStack> {
        self.inventories
            .iter()
            .flat_map(|inv| inv.stacks.iter())
            .chain(self.specific.item_stacks())
    }
}

/// One terrain tile.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileRecord {
    pub name: String,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub station: String,
    pub wait_conditions: Vec<String>,
}

/// A platform's travel schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub current: u32,
    pub records: Vec<ScheduleRecord>,
}

/// Platform-level metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMeta {
    pub name: String,
    pub force: String,
    pub schedule: Option<Schedule>,
    pub paused: bool,
}

// ---------------------------------------------------------------------------
// Verification totals
// ---------------------------------------------------------------------------

/// Relative tolerance when comparing fluid totals for consistency.
const FLUID_EPSILON: f64 = 1e-6;

/// Per-item and per-fluid aggregate counts used as validation ground truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationTotals {
    pub items: BTreeMap<String, u64>,
    pub fluids: BTreeMap<String, f64>,
    pub entity_count: u64,
    pub tile_count: u64,
}

impl VerificationTotals {
    pub fn add_item(&mut self, name: &str, count: u64) {
        if count > 0 {
            *self.items.entry(name.to_string()).or_insert(0) += count;
        }
    }

    pub fn add_fluid(&mut self, name: &str, amount: f64) {
        if amount > 0.0 {
            *self.fluids.entry(name.to_string()).or_insert(0.0) += amount;
        }
    }

    /// Derive totals from records alone, without consulting any world.
    pub fn from_records(records: &[EntityRecord], tile_count: usize) -> Self {
        let mut totals = VerificationTotals {
            tile_count: tile_count as u64,
            ..Default::default()
        };
        for record in records {
            if record.category != EntityCategory::ItemOnGround {
                totals.entity_count += 1;
            }
            for stack in record.all_item_stacks() {
                totals.add_item(&stack.name, stack.count as u64);
            }
            for fluid in &record.fluids {
                totals.add_fluid(&fluid.contents.name, fluid.contents.amount);
            }
        }
        totals
    }

    pub fn total_items(&self) -> u64 {
        self.items.values().sum()
    }

    pub fn total_fluid(&self) -> f64 {
        self.fluids.values().sum()
    }

    /// Human-readable differences between two totals. Empty when equal.
    pub fn differences(&self, other: &VerificationTotals) -> Vec<String> {
        let mut diffs = Vec::new();
        if self.entity_count != other.entity_count {
            diffs.push(format!(
                "entity count {} vs {}",
                self.entity_count, other.entity_count
            ));
        }
        if self.tile_count != other.tile_count {
            diffs.push(format!("tile count {} vs {}", self.tile_count, other.tile_count));
        }
        let item_names: std::collections::BTreeSet<&String> =
            self.items.keys().chain(other.items.keys()).collect();
        for name in item_names {
            let a = self.items.get(name).copied().unwrap_or(0);
            let b = other.items.get(name).copied().unwrap_or(0);
            if a != b {
                diffs.push(format!("item {name}: {a} vs {b}"));
            }
        }
        let fluid_names: std::collections::BTreeSet<&String> =
            self.fluids.keys().chain(other.fluids.keys()).collect();
        for name in fluid_names {
            let a = self.fluids.get(name).copied().unwrap_or(0.0);
            let b = other.fluids.get(name).copied().unwrap_or(0.0);
            if (a - b).abs() > FLUID_EPSILON * a.abs().max(b.abs()).max(1.0) {
                diffs.push(format!("fluid {name}: {a:.3} vs {b:.3}"));
            }
        }
        diffs
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Root export artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformSnapshot {
    pub schema_version: u32,
    /// Engine/mod version of the exporting process.
    pub source_version: String,
    pub captured_at: Ticks,
    pub platform: PlatformMeta,
    /// Sorted entities followed by ground items.
    pub entities: Vec<EntityRecord>,
    pub tiles: Vec<TileRecord>,
    /// Active flags as they were before the platform was locked.
    pub frozen_states: BTreeMap<StableId, bool>,
    pub totals: VerificationTotals,
}
