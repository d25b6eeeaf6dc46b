//! Belt restoration (import phase 5).
//!
//! Runs inside a single tick so nothing can pick items off a half-filled
//! belt. Each item goes to its exact recorded slot; if that slot is taken
//! it is appended to the lane's back; if both fail it is tallied as lost.
//! Loose ground items are placed in the same pass.

use std::collections::BTreeMap;

use crate::id::{EntityHandle, StableId, SurfaceId};
use crate::loss::LossTally;
use crate::model::{EntityRecord, SpecificData};
use crate::world::World;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeltSummary {
    pub exact: usize,
    pub fallback: usize,
    pub lost: usize,
    pub ground: usize,
}

pub fn restore_belts(
    world: &mut dyn World,
    surface: SurfaceId,
    records: &[EntityRecord],
    entity_map: &BTreeMap<StableId, EntityHandle>,
    losses: &mut LossTally,
) -> BeltSummary {
    let mut summary = BeltSummary::default();
    for record in records {
        match &record.specific {
            SpecificData::Belt { lanes, .. } => {
                let Some(&entity) = entity_map.get(&record.stable_id) else {
                    continue;
                };
                for (lane, items) in lanes.iter().enumerate() {
                    for item in items {
                        if world.belt_insert_at(entity, lane, item.position, &item.stack) {
                            summary.exact += 1;
                        } else if world.belt_insert_at_back(entity, lane, &item.stack) {
                            summary.fallback += 1;
                            losses.belt_fallbacks += 1;
                        } else {
                            summary.lost += 1;
                            losses.add_items(&item.stack.name, item.stack.count as u64);
                        }
                    }
                }
            }
            SpecificData::GroundItem { stack } => {
                if world.place_ground_item(surface, record.position, stack) {
                    summary.ground += 1;
                } else {
                    summary.lost += 1;
                    losses.add_items(&stack.name, stack.count as u64);
                }
            }
            _ => {}
        }
    }
    if summary.fallback > 0 || summary.lost > 0 {
        tracing::debug!(
            exact = summary.exact,
            fallback = summary.fallback,
            lost = summary.lost,
            "belt_restore_degraded"
        );
    }
    summary
}
