//! Starlift Controller -- the orchestrating layer between simulation
//! processes.
//!
//! Each process is reached through a [`channel::ControlChannel`] that only
//! moves strings. The [`controller::TransferController`] locks the source,
//! pulls its export, pushes it to the destination, waits for the
//! validation report and then either deletes the source or rolls back.
//!
//! # Key Types
//!
//! - [`transfer::TransferRecord`] -- One transfer and its state machine.
//! - [`log::TransactionLog`] -- Append-only history of every transition.
//! - [`store::SnapshotStore`] -- Bounded cache of transferred payloads.
//! - [`config::ControllerConfig`] -- Timeouts, resend limits, cleanup.

pub mod channel;
pub mod config;
pub mod controller;
pub mod log;
pub mod store;
pub mod transfer;

pub use controller::{ControllerError, TransferController};
