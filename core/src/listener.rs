use async_trait::async_trait;
use runq_protocol::QueueEvent;
use runq_protocol::QueuedRun;

use crate::error::QueueError;

/// Callbacks surfaced to submitters.
///
/// All methods default to no-ops so implementations only override what they
/// need. Errors raised inside listeners never reach the scheduler; the
/// worker logs and moves on. `on_event` is invoked synchronously on the
/// transitioning thread and must not block.
#[async_trait]
pub trait QueueListener: Send + Sync {
    /// One streamed output chunk.
    async fn on_output(&self, run_id: &str, chunk: &str) {
        let _ = (run_id, chunk);
    }

    /// Fired once, after the run reached SUCCEEDED and (when persistence is
    /// enabled) after the terminal record hit the store.
    async fn on_complete(&self, run_id: &str, run: &QueuedRun) {
        let _ = (run_id, run);
    }

    /// Fired once, after the run reached FAILED and after persistence.
    async fn on_error(&self, run_id: &str, error: &QueueError) {
        let _ = (run_id, error);
    }

    /// Every scheduler state transition.
    fn on_event(&self, event: &QueueEvent) {
        let _ = event;
    }
}
