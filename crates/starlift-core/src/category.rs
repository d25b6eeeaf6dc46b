//! Entity categories and the per-category extract/restore registry.
//!
//! Each category that carries bespoke fields registers a
//! [`CategoryHandler`]: an extractor that reads those fields from a live
//! entity into [`SpecificData`], and a restorer that writes them back onto a
//! freshly created entity. Adding a category means adding one enum variant
//! and, if it has specific data, one handler pair.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::EntityHandle;
use crate::loss::LossTally;
use crate::model::{EntityRecord, SpecificData};
use crate::world::World;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// The kind of a simulated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityCategory {
    // Production
    AssemblingMachine,
    Furnace,
    Lab,
    RocketSilo,
    MiningDrill,
    Crusher,
    AsteroidCollector,
    AgriculturalTower,
    Beacon,
    // Power
    Boiler,
    Generator,
    BurnerGenerator,
    Reactor,
    FusionReactor,
    FusionGenerator,
    SolarPanel,
    Accumulator,
    // Logistics
    Inserter,
    TransportBelt,
    UndergroundBelt,
    Splitter,
    LaneSplitter,
    Loader,
    LinkedBelt,
    Pump,
    OffshorePump,
    Roboport,
    // Movement
    Thruster,
    Car,
    // Misc
    Radar,
    Lamp,
    Turret,
    ArithmeticCombinator,
    DeciderCombinator,
    SelectorCombinator,
    // Never frozen
    SpacePlatformHub,
    Container,
    LogisticContainer,
    CargoBay,
    Pipe,
    PipeToGround,
    StorageTank,
    ElectricPole,
    PowerSwitch,
    ConstantCombinator,
    HeatPipe,
    Wall,
    ItemOnGround,
    Other,
}

/// Grouping of freezable categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FreezeGroup {
    Production,
    Power,
    Logistics,
    Movement,
    Misc,
}

/// Categories whose active flag can be toggled without destroying state.
pub const FREEZABLE: [EntityCategory; 35] = [
    EntityCategory::AssemblingMachine,
    EntityCategory::Furnace,
    EntityCategory::Lab,
    EntityCategory::RocketSilo,
    EntityCategory::MiningDrill,
    EntityCategory::Crusher,
    EntityCategory::AsteroidCollector,
    EntityCategory::AgriculturalTower,
    EntityCategory::Beacon,
    EntityCategory::Boiler,
    EntityCategory::Generator,
    EntityCategory::BurnerGenerator,
    EntityCategory::Reactor,
    EntityCategory::FusionReactor,
    EntityCategory::FusionGenerator,
    EntityCategory::SolarPanel,
    EntityCategory::Accumulator,
    EntityCategory::Inserter,
    EntityCategory::TransportBelt,
    EntityCategory::UndergroundBelt,
    EntityCategory::Splitter,
    EntityCategory::LaneSplitter,
    EntityCategory::Loader,
    EntityCategory::LinkedBelt,
    EntityCategory::Pump,
    EntityCategory::OffshorePump,
    EntityCategory::Roboport,
    EntityCategory::Thruster,
    EntityCategory::Car,
    EntityCategory::Radar,
    EntityCategory::Lamp,
    EntityCategory::Turret,
    EntityCategory::ArithmeticCombinator,
    EntityCategory::DeciderCombinator,
    EntityCategory::SelectorCombinator,
];

impl EntityCategory {
    /// The freeze group this category belongs to, or `None` when the
    /// category is never frozen.
    pub fn freeze_group(self) -> Option<FreezeGroup> {
        use EntityCategory::*;
        match self {
            AssemblingMachine | Furnace | Lab | RocketSilo | MiningDrill | Crusher
            | AsteroidCollector | AgriculturalTower | Beacon => Some(FreezeGroup::Production),
            Boiler | Generator | BurnerGenerator | Reactor | FusionReactor | FusionGenerator
            | SolarPanel | Accumulator => Some(FreezeGroup::Power),
            Inserter | TransportBelt | UndergroundBelt | Splitter | LaneSplitter | Loader
            | LinkedBelt | Pump | OffshorePump | Roboport => Some(FreezeGroup::Logistics),
            Thruster | Car => Some(FreezeGroup::Movement),
            Radar | Lamp | Turret | ArithmeticCombinator | DeciderCombinator
            | SelectorCombinator => Some(FreezeGroup::Misc),
            SpacePlatformHub | Container | LogisticContainer | CargoBay | Pipe | PipeToGround
            | StorageTank | ElectricPole | PowerSwitch | ConstantCombinator | HeatPipe | Wall
            | ItemOnGround | Other => None,
        }
    }

    pub fn is_freezable(self) -> bool {
        self.freeze_group().is_some()
    }

    /// Belt-like categories whose lane contents are restored in the
    /// single-tick belt phase.
    pub fn is_belt(self) -> bool {
        matches!(
            self,
            EntityCategory::TransportBelt
                | EntityCategory::UndergroundBelt
                | EntityCategory::Splitter
                | EntityCategory::LaneSplitter
                | EntityCategory::Loader
                | EntityCategory::LinkedBelt
        )
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Reads category-specific fields from a live entity.
pub type ExtractFn = fn(&dyn World, EntityHandle) -> SpecificData;

/// Writes category-specific fields onto a newly created entity, tallying
/// anything that could not be restored.
pub type RestoreFn = fn(&mut dyn World, EntityHandle, &EntityRecord, &mut LossTally);

/// An extractor/restorer pair for one category.
#[derive(Clone, Copy)]
pub struct CategoryHandler {
    pub extract: ExtractFn,
    pub restore: RestoreFn,
}

impl std::fmt::Debug for CategoryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategoryHandler").finish_non_exhaustive()
    }
}

fn extract_none(_world: &dyn World, _entity: EntityHandle) -> SpecificData {
    SpecificData::None
}

fn restore_none(
    _world: &mut dyn World,
    _entity: EntityHandle,
    _record: &EntityRecord,
    _losses: &mut LossTally,
) {
}

fn extract_crafting(world: &dyn World, entity: EntityHandle) -> SpecificData {
    world
        .recipe_state(entity)
        .map(SpecificData::Crafting)
        .unwrap_or_default()
}

fn restore_crafting(
    world: &mut dyn World,
    entity: EntityHandle,
    record: &EntityRecord,
    losses: &mut LossTally,
) {
    if let SpecificData::Crafting(state) = &record.specific {
        if !world.set_recipe_state(entity, state) {
            losses.state_failures += 1;
        }
    }
}

fn extract_belt(world: &dyn World, entity: EntityHandle) -> SpecificData {
    SpecificData::Belt {
        lanes: world.belt_lanes(entity),
        io_type: world.belt_io_type(entity),
        splitter: world.splitter_settings(entity),
    }
}

/// Lane contents wait for the belt phase; only splitter settings are
/// applied at creation.
fn restore_belt(
    world: &mut dyn World,
    entity: EntityHandle,
    record: &EntityRecord,
    losses: &mut LossTally,
) {
    if let SpecificData::Belt {
        splitter: Some(settings),
        ..
    } = &record.specific
    {
        if !world.set_splitter_settings(entity, settings) {
            losses.state_failures += 1;
        }
    }
}

fn extract_inserter(world: &dyn World, entity: EntityHandle) -> SpecificData {
    SpecificData::Inserter {
        held: world.held_stack(entity),
    }
}

fn restore_inserter(
    world: &mut dyn World,
    entity: EntityHandle,
    record: &EntityRecord,
    losses: &mut LossTally,
) {
    if let SpecificData::Inserter { held: Some(stack) } = &record.specific {
        if !world.set_held_stack(entity, stack) {
            losses.add_items(&stack.name, stack.count as u64);
        }
    }
}

fn extract_container(world: &dyn World, entity: EntityHandle) -> SpecificData {
    SpecificData::Container {
        bar: world.container_bar(entity),
    }
}

fn restore_container(
    world: &mut dyn World,
    entity: EntityHandle,
    record: &EntityRecord,
    losses: &mut LossTally,
) {
    if let SpecificData::Container { bar: Some(bar) } = &record.specific {
        if !world.set_container_bar(entity, Some(*bar)) {
            losses.state_failures += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps each category to its handler pair. Categories without an entry use
/// a handler that extracts and restores nothing.
#[derive(Debug, Clone)]
pub struct CategoryRegistry {
    handlers: BTreeMap<EntityCategory, CategoryHandler>,
    fallback: CategoryHandler,
}

impl CategoryRegistry {
    /// A registry with no category-specific handlers.
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
            fallback: CategoryHandler {
                extract: extract_none,
                restore: restore_none,
            },
        }
    }

    /// Register (or replace) the handler pair for a category.
    pub fn register(&mut self, category: EntityCategory, handler: CategoryHandler) {
        self.handlers.insert(category, handler);
    }

    pub fn handler(&self, category: EntityCategory) -> &CategoryHandler {
        self.handlers.get(&category).unwrap_or(&self.fallback)
    }

    pub fn has_handler(&self, category: EntityCategory) -> bool {
        self.handlers.contains_key(&category)
    }

    pub fn extract(
        &self,
        world: &dyn World,
        category: EntityCategory,
        entity: EntityHandle,
    ) -> SpecificData {
        (self.handler(category).extract)(world, entity)
    }

    pub fn restore(
        &self,
        world: &mut dyn World,
        entity: EntityHandle,
        record: &EntityRecord,
        losses: &mut LossTally,
    ) {
        (self.handler(record.category).restore)(world, entity, record, losses)
    }
}

impl Default for CategoryRegistry {
    fn default() -> Self {
        use EntityCategory::*;

        let mut registry = Self::empty();
        let crafting = CategoryHandler {
            extract: extract_crafting,
            restore: restore_crafting,
        };
        for category in [AssemblingMachine, Furnace, Crusher, RocketSilo] {
            registry.register(category, crafting);
        }
        let belt = CategoryHandler {
            extract: extract_belt,
            restore: restore_belt,
        };
        for category in [
            TransportBelt,
            UndergroundBelt,
            Splitter,
            LaneSplitter,
            Loader,
            LinkedBelt,
        ] {
            registry.register(category, belt);
        }
        registry.register(
            Inserter,
            CategoryHandler {
                extract: extract_inserter,
                restore: restore_inserter,
            },
        );
        let container = CategoryHandler {
            extract: extract_container,
            restore: restore_container,
        };
        for category in [Container, LogisticContainer, CargoBay] {
            registry.register(category, container);
        }
        registry
    }
}
