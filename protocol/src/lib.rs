//! Shared data model for the runq queue system.
//!
//! This crate is intentionally small: the run record, its state machine
//! vocabulary, stream chunks, queue events, and aggregate statistics. All
//! behavior (scheduling, execution, persistence) lives in `runq-core` and
//! `runq-state`.

mod events;
mod run;
mod stats;

pub use events::QueueEvent;
pub use events::QueueEventMsg;
pub use run::ChatMessage;
pub use run::QueuedRun;
pub use run::RunPriority;
pub use run::RunState;
pub use run::StreamChunk;
pub use run::new_run_id;
pub use stats::QueueStats;
