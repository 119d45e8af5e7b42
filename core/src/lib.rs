//! Core of the runq queue system: the priority-FIFO scheduler, the worker
//! pool that drives streaming executors, and the manager that composes both
//! with the durable store in `runq-state`.
//!
//! All scheduler state mutation is serialized through one mutex held only
//! for selection and set mutation; events are delivered after the lock is
//! released. Workers are cooperative tokio tasks that observe cancellation
//! tokens at every suspension point.

mod config;
mod error;
mod executor;
mod listener;
mod manager;
mod scheduler;
mod tools;
mod worker;

pub use config::DropStrategy;
pub use config::QueueConfig;
pub use error::ExecutorError;
pub use error::QueueError;
pub use error::Result;
pub use executor::AgentExecutor;
pub use executor::ChunkIter;
pub use executor::ChunkStream;
pub use executor::ExecutionRequest;
pub use listener::QueueListener;
pub use manager::QueueManager;
pub use manager::SubmitRequest;
pub use scheduler::QueueScheduler;
pub use tools::ExecutorTool;
pub use tools::ToolRegistry;
pub use worker::StreamBuffer;
pub use worker::WorkerPool;
