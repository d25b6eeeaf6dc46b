//! Post-import validation with asymmetric tolerances.
//!
//! Source totals (captured at export) are compared with totals measured on
//! the rebuilt platform. Gains are treated as far more suspicious than
//! losses: a little loss has legitimate causes, a gain should not happen.
//!
//! Items, per type:
//! - gain above `item_gain_limit` fails;
//! - loss above `item_loss_ratio` of the source *and* above
//!   `item_loss_absolute` units fails;
//! - any smaller loss is a warning;
//! - a type absent from the source is flagged above `unexpected_item_flag`.
//!
//! Fluids, per type:
//! - gain above `fluid_gain_limit` fails;
//! - more than `fluid_vanish_expected` expected but under
//!   `fluid_vanish_actual` present fails;
//! - partial loss is fine;
//! - a type absent from the source is flagged above `unexpected_fluid_flag`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::VerificationTotals;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToleranceConfig {
    pub item_gain_limit: u64,
    pub item_loss_ratio: f64,
    pub item_loss_absolute: u64,
    pub unexpected_item_flag: u64,
    pub fluid_gain_limit: f64,
    pub fluid_vanish_expected: f64,
    pub fluid_vanish_actual: f64,
    pub unexpected_fluid_flag: f64,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            item_gain_limit: 5,
            item_loss_ratio: 0.95,
            item_loss_absolute: 100,
            unexpected_item_flag: 20,
            fluid_gain_limit: 500.0,
            fluid_vanish_expected: 1000.0,
            fluid_vanish_actual: 1.0,
            unexpected_fluid_flag: 100.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Ok,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCheck {
    pub name: String,
    pub expected: u64,
    pub actual: u64,
    pub verdict: Verdict,
    /// Present at the destination in quantity but absent from the source.
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluidCheck {
    pub name: String,
    pub expected: f64,
    pub actual: f64,
    pub verdict: Verdict,
    pub flagged: bool,
}

/// The numbers the verdicts were derived from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub items: Vec<ItemCheck>,
    pub fluids: Vec<FluidCheck>,
    pub expected_items: u64,
    pub actual_items: u64,
    pub expected_fluid: f64,
    pub actual_fluid: f64,
    pub expected_entities: u64,
}

impl ValidationMetrics {
    pub fn warnings(&self) -> usize {
        self.items.iter().filter(|c| c.verdict == Verdict::Warn).count()
            + self.fluids.iter().filter(|c| c.verdict == Verdict::Warn).count()
    }

    pub fn flagged(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|c| c.flagged)
            .map(|c| c.name.clone())
            .chain(self.fluids.iter().filter(|c| c.flagged).map(|c| c.name.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub item_count_match: bool,
    pub fluid_count_match: bool,
    pub mismatch_details: String,
    /// Entities present on the rebuilt platform.
    pub entity_count: u64,
    pub metrics: ValidationMetrics,
}

impl ValidationResult {
    pub fn success(&self) -> bool {
        self.item_count_match && self.fluid_count_match
    }

    /// A failed result for an import that never got far enough to measure.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            item_count_match: false,
            fluid_count_match: false,
            mismatch_details: reason.into(),
            entity_count: 0,
            metrics: ValidationMetrics::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

pub fn check_item(name: &str, expected: u64, actual: u64, tol: &ToleranceConfig) -> ItemCheck {
    let verdict = if actual > expected {
        if actual - expected > tol.item_gain_limit {
            Verdict::Fail
        } else {
            Verdict::Warn
        }
    } else if actual < expected {
        let loss = expected - actual;
        let ratio = loss as f64 / expected as f64;
        if ratio > tol.item_loss_ratio && loss > tol.item_loss_absolute {
            Verdict::Fail
        } else {
            Verdict::Warn
        }
    } else {
        Verdict::Ok
    };
    ItemCheck {
        name: name.to_string(),
        expected,
        actual,
        verdict,
        flagged: expected == 0 && actual > tol.unexpected_item_flag,
    }
}

pub fn check_fluid(name: &str, expected: f64, actual: f64, tol: &ToleranceConfig) -> FluidCheck {
    let verdict = if actual - expected > tol.fluid_gain_limit {
        Verdict::Fail
    } else if expected > tol.fluid_vanish_expected && actual < tol.fluid_vanish_actual {
        Verdict::Fail
    } else {
        Verdict::Ok
    };
    FluidCheck {
        name: name.to_string(),
        expected,
        actual,
        verdict,
        flagged: expected <= 0.0 && actual > tol.unexpected_fluid_flag,
    }
}

/// Compare export-time totals with post-import totals.
pub fn validate(
    source: &VerificationTotals,
    dest: &VerificationTotals,
    tol: &ToleranceConfig,
) -> ValidationResult {
    let mut metrics = ValidationMetrics {
        expected_items: source.total_items(),
        actual_items: dest.total_items(),
        expected_fluid: source.total_fluid(),
        actual_fluid: dest.total_fluid(),
        expected_entities: source.entity_count,
        ..Default::default()
    };
    let mut details = Vec::new();

    let item_names: BTreeSet<&String> = source.items.keys().chain(dest.items.keys()).collect();
    for name in item_names {
        let expected = source.items.get(name).copied().unwrap_or(0);
        let actual = dest.items.get(name).copied().unwrap_or(0);
        let check = check_item(name, expected, actual, tol);
        if check.verdict == Verdict::Fail {
            details.push(format!("item {name}: expected {expected}, found {actual}"));
        }
        metrics.items.push(check);
    }

    let fluid_names: BTreeSet<&String> = source.fluids.keys().chain(dest.fluids.keys()).collect();
    for name in fluid_names {
        let expected = source.fluids.get(name).copied().unwrap_or(0.0);
        let actual = dest.fluids.get(name).copied().unwrap_or(0.0);
        let check = check_fluid(name, expected, actual, tol);
        if check.verdict == Verdict::Fail {
            details.push(format!("fluid {name}: expected {expected:.1}, found {actual:.1}"));
        }
        metrics.fluids.push(check);
    }

    let item_count_match = metrics.items.iter().all(|c| c.verdict != Verdict::Fail);
    let fluid_count_match = metrics.fluids.iter().all(|c| c.verdict != Verdict::Fail);
    let flagged = metrics.flagged();
    if !flagged.is_empty() {
        details.push(format!("unexpected types: {}", flagged.join(", ")));
    }

    tracing::info!(
        items_ok = item_count_match,
        fluids_ok = fluid_count_match,
        warnings = metrics.warnings(),
        "validation_verdict"
    );

    ValidationResult {
        item_count_match,
        fluid_count_match,
        mismatch_details: details.join("; "),
        entity_count: dest.entity_count,
        metrics,
    }
}
