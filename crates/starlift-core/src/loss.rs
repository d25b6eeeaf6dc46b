//! Tallies of everything an import could not restore.
//!
//! Per-entity, per-item and per-fluid failures during reconstruction are
//! recovered locally: the pipeline counts them here and keeps going. The
//! tally travels with the validation report and is announced once as a
//! single aggregated warning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::EntityRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossTally {
    /// Entities that could not be created, by entity name.
    pub entities_failed: BTreeMap<String, u32>,
    /// Items that could not be placed anywhere, by item name.
    pub items: BTreeMap<String, u64>,
    /// Fluid that a write accepted less of than requested, by fluid name.
    pub fluid_write_loss: BTreeMap<String, f64>,
    /// Fluid clamped away because a segment exceeded its target's capacity.
    pub fluid_overflow: BTreeMap<String, f64>,
    /// Belt items placed at the lane's back instead of their exact slot.
    pub belt_fallbacks: u32,
    /// Wires whose target was never created or that the world refused to
    /// connect.
    pub dangling_wires: u32,
    /// Settings (recipe, filters, behaviour, ...) the world refused.
    pub state_failures: u32,
}

impl LossTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_items(&mut self, name: &str, count: u64) {
        if count > 0 {
            *self.items.entry(name.to_string()).or_insert(0) += count;
        }
    }

    pub fn add_fluid_write_loss(&mut self, name: &str, amount: f64) {
        if amount > 0.0 {
            *self.fluid_write_loss.entry(name.to_string()).or_insert(0.0) += amount;
        }
    }

    pub fn add_fluid_overflow(&mut self, name: &str, amount: f64) {
        if amount > 0.0 {
            *self.fluid_overflow.entry(name.to_string()).or_insert(0.0) += amount;
        }
    }

    /// Count an entity that failed to be created, along with everything it
    /// was carrying.
    pub fn record_entity_failure(&mut self, record: &EntityRecord) {
        *self.entities_failed.entry(record.name.clone()).or_insert(0) += 1;
        for stack in record.all_item_stacks() {
            self.add_items(&stack.name, stack.count as u64);
        }
        for fluid in &record.fluids {
            self.add_fluid_write_loss(&fluid.contents.name, fluid.contents.amount);
        }
    }

    pub fn entities_failed_total(&self) -> u32 {
        self.entities_failed.values().sum()
    }

    pub fn items_lost_total(&self) -> u64 {
        self.items.values().sum()
    }

    pub fn fluid_lost_total(&self) -> f64 {
        self.fluid_write_loss.values().sum::<f64>() + self.fluid_overflow.values().sum::<f64>()
    }

    /// Whether nothing at all was lost. Belt fallbacks still count as
    /// restored and do not make a tally non-empty.
    pub fn is_empty(&self) -> bool {
        self.entities_failed.is_empty()
            && self.items.is_empty()
            && self.fluid_write_loss.is_empty()
            && self.fluid_overflow.is_empty()
            && self.dangling_wires == 0
            && self.state_failures == 0
    }

    /// One-line aggregate for announcements.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "no losses".to_string();
        }
        let mut parts = Vec::new();
        if !self.entities_failed.is_empty() {
            let names: Vec<String> = self
                .entities_failed
                .iter()
                .map(|(name, n)| format!("{name} x{n}"))
                .collect();
            parts.push(format!("entities failed: {}", names.join(", ")));
        }
        if !self.items.is_empty() {
            let names: Vec<String> = self
                .items
                .iter()
                .map(|(name, n)| format!("{name} x{n}"))
                .collect();
            parts.push(format!("items lost: {}", names.join(", ")));
        }
        let fluids = self.fluid_lost_total();
        if fluids > 0.0 {
            parts.push(format!("fluid lost: {fluids:.1}"));
        }
        if self.dangling_wires > 0 {
            parts.push(format!("dangling wires: {}", self.dangling_wires));
        }
        if self.state_failures > 0 {
            parts.push(format!("settings not restored: {}", self.state_failures));
        }
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tally_summary() {
        let tally = LossTally::new();
        assert!(tally.is_empty());
        assert_eq!(tally.summary(), "no losses");
    }

    #[test]
    fn belt_fallbacks_alone_are_not_losses() {
        let tally = LossTally {
            belt_fallbacks: 3,
            ..Default::default()
        };
        assert!(tally.is_empty());
    }

    #[test]
    fn items_and_fluids_accumulate() {
        let mut tally = LossTally::new();
        tally.add_items("iron-plate", 5);
        tally.add_items("iron-plate", 7);
        tally.add_fluid_overflow("water", 10.0);
        tally.add_fluid_write_loss("water", 2.5);
        assert_eq!(tally.items["iron-plate"], 12);
        assert_eq!(tally.items_lost_total(), 12);
        assert!((tally.fluid_lost_total() - 12.5).abs() < 1e-9);
        let summary = tally.summary();
        assert!(summary.contains("iron-plate x12"));
        assert!(summary.contains("fluid lost: 12.5"));
    }

    #[test]
    fn zero_amounts_are_ignored() {
        let mut tally = LossTally::new();
        tally.add_items("iron-plate", 0);
        tally.add_fluid_overflow("water", 0.0);
        assert!(tally.is_empty());
    }
}
