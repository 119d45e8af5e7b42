use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

/// A tool handle passed through to the executor.
///
/// Tools hold process-local resources (closures, sockets, handles) that
/// cannot survive serialization, which is why they live in this runtime
/// registry instead of the run's persisted config.
pub trait ExecutorTool: Send + Sync {
    fn name(&self) -> &str;
}

const DEFAULT_KEY: &str = "default";

/// Process-wide map from run id (or the default slot) to tool handles.
///
/// Submitters register before calling submit; the manager unregisters when
/// the run reaches a terminal state. Never persisted.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    inner: Arc<Mutex<HashMap<String, Vec<Arc<dyn ExecutorTool>>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: &str, tools: Vec<Arc<dyn ExecutorTool>>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.insert(run_id.to_string(), tools);
    }

    /// Tools applied to any run without a run-specific registration.
    pub fn register_default(&self, tools: Vec<Arc<dyn ExecutorTool>>) {
        self.register(DEFAULT_KEY, tools);
    }

    pub fn unregister(&self, run_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.remove(run_id);
    }

    /// Run-specific tools, falling back to the default slot.
    pub fn tools_for(&self, run_id: &str) -> Vec<Arc<dyn ExecutorTool>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(run_id)
            .or_else(|| inner.get(DEFAULT_KEY))
            .cloned()
            .unwrap_or_default()
    }
}
