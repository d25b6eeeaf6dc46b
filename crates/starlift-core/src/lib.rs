//! Starlift Core -- moves a running space platform from one simulation
//! process to another.
//!
//! The crate captures a platform's complete state into a deterministic
//! [`model::PlatformSnapshot`], encodes it for a string-only control
//! channel, and rebuilds it on the destination with an explicit tally of
//! anything that could not be restored.
//!
//! # Transfer Flow
//!
//! 1. **Lock** -- [`lock::LockTable`] flushes in-flight deliveries, freezes
//!    every freezable entity and records the pre-lock active flags.
//! 2. **Export** -- [`export::ExportJob`] scans the surface a batch per
//!    tick and checks record totals against a live measurement.
//! 3. **Transport** -- [`codec`] encodes, compresses and chunks the
//!    snapshot; [`reassembly`] rebuilds it on the far side.
//! 4. **Import** -- [`import::ImportJob`] runs the seven-phase pipeline:
//!    tiles, hub mapping, entities, fluids, belts, state, activation.
//! 5. **Validate** -- [`validation::validate`] compares source totals with
//!    the rebuilt platform under configurable tolerances.
//!
//! # Key Types
//!
//! - [`world::World`] -- The object-safe seam to the host simulation.
//! - [`instance::Instance`] -- One process: world, registry and config,
//!   driven by JSON instructions and a per-tick hook.
//! - [`job::Scheduler`] -- Budgeted, resumable jobs advanced once per tick.
//! - [`category::CategoryRegistry`] -- Per-category extract/restore pairs.
//! - [`loss::LossTally`] -- Everything an import could not restore.

pub mod belt;
pub mod category;
pub mod codec;
pub mod config;
pub mod export;
pub mod fixed;
pub mod fluid;
pub mod id;
pub mod import;
pub mod instance;
pub mod job;
pub mod lock;
pub mod loss;
pub mod model;
pub mod protocol;
pub mod reassembly;
pub mod registry;
pub mod scanner;
pub mod validation;
pub mod world;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory_world;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
