//! SQLite-backed persistence for the runq queue system.
//!
//! This crate owns the durable copy of every run and session record: crash
//! recovery queries, history listings, aggregate statistics, and cleanup.
//! The in-memory scheduler in `runq-core` stays authoritative while the
//! process is alive; this store converges through explicit writes and
//! autosave.

mod migrations;
mod model;
mod runtime;

pub use model::RunFilter;
pub use model::SessionRecord;
pub use runtime::QueueStore;
pub use runtime::SCHEMA_VERSION;

/// Canonical error recorded for runs found RUNNING at startup.
pub const INTERRUPTED_ERROR: &str = "Interrupted by crash/restart";
