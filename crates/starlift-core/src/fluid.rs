//! Fluid restoration (import phase 4).
//!
//! Fluid boxes that shared a segment at the source are restored as one
//! pool: amounts are summed, temperature is the volume-weighted average,
//! and the pool is written once through the member whose destination-side
//! box reports the largest capacity. Some entity kinds report only their
//! local buffer, and writing a whole segment through one of them would
//! truncate it. Anything clamped or refused is tallied.

use std::collections::BTreeMap;

use crate::id::{EntityHandle, StableId};
use crate::loss::LossTally;
use crate::model::{EntityRecord, FluidContents};
use crate::world::World;

/// Counters for one fluid phase run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FluidSummary {
    pub segments: usize,
    pub direct: usize,
    pub written: f64,
}

#[derive(Debug, Default)]
struct SegmentClaim {
    /// (entity, box index) of every member that held fluid, in record order.
    members: Vec<(EntityHandle, u32)>,
    /// Per fluid name: (amount, amount * temperature).
    fluids: BTreeMap<String, (f64, f64)>,
}

fn reported_capacity(world: &dyn World, entity: EntityHandle, index: u32) -> f64 {
    world
        .fluid_boxes(entity)
        .into_iter()
        .find(|fb| fb.index == index)
        .map(|fb| fb.capacity)
        .unwrap_or(0.0)
}

/// Write the fluid of every record onto its mapped entity.
pub fn restore_fluids(
    world: &mut dyn World,
    records: &[EntityRecord],
    entity_map: &BTreeMap<StableId, EntityHandle>,
    losses: &mut LossTally,
) -> FluidSummary {
    let mut summary = FluidSummary::default();
    let mut segments: BTreeMap<u64, SegmentClaim> = BTreeMap::new();

    for record in records {
        if record.fluids.is_empty() {
            continue;
        }
        // Entities that failed creation had their fluid tallied already.
        let Some(&entity) = entity_map.get(&record.stable_id) else {
            continue;
        };
        for fluid in &record.fluids {
            match fluid.segment {
                Some(segment) => {
                    let claim = segments.entry(segment).or_default();
                    claim.members.push((entity, fluid.index));
                    let slot = claim
                        .fluids
                        .entry(fluid.contents.name.clone())
                        .or_insert((0.0, 0.0));
                    slot.0 += fluid.contents.amount;
                    slot.1 += fluid.contents.amount * fluid.contents.temperature;
                }
                None => {
                    let accepted = world.write_fluid(entity, fluid.index, &fluid.contents);
                    let lost = fluid.contents.amount - accepted;
                    losses.add_fluid_write_loss(&fluid.contents.name, lost);
                    summary.direct += 1;
                    summary.written += accepted;
                }
            }
        }
    }

    for (segment, claim) in segments {
        // A segment holds one fluid. If the source somehow reported more,
        // the largest wins and the rest is lost.
        let mut dominant: Option<(&String, f64, f64)> = None;
        for (name, &(amount, weighted)) in &claim.fluids {
            if dominant.is_none_or(|(_, best, _)| amount > best) {
                dominant = Some((name, amount, weighted));
            }
        }
        let Some((name, amount, weighted)) = dominant else {
            continue;
        };
        for (other, &(other_amount, _)) in &claim.fluids {
            if other != name {
                losses.add_fluid_write_loss(other, other_amount);
            }
        }
        if amount <= 0.0 {
            continue;
        }

        let mut target: Option<(EntityHandle, u32, f64)> = None;
        for &(entity, index) in &claim.members {
            let capacity = reported_capacity(&*world, entity, index);
            if target.is_none_or(|(_, _, best)| capacity > best) {
                target = Some((entity, index, capacity));
            }
        }
        let Some((entity, index, capacity)) = target else {
            continue;
        };

        let write = amount.min(capacity);
        if amount > write {
            losses.add_fluid_overflow(name, amount - write);
            tracing::debug!(
                segment,
                fluid = %name,
                overflow = amount - write,
                "fluid_segment_clamped"
            );
        }
        let contents = FluidContents {
            name: name.clone(),
            amount: write,
            temperature: weighted / amount,
        };
        let accepted = if write > 0.0 {
            world.write_fluid(entity, index, &contents)
        } else {
            0.0
        };
        losses.add_fluid_write_loss(name, write - accepted);
        summary.segments += 1;
        summary.written += accepted;
    }

    summary
}
