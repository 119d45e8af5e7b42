//! Stub executors and listeners shared by the integration suite.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use runq_core::AgentExecutor;
use runq_core::ChunkStream;
use runq_core::ExecutionRequest;
use runq_core::ExecutorError;
use runq_core::QueueConfig;
use runq_core::QueueError;
use runq_core::QueueListener;
use runq_core::QueueManager;
use runq_protocol::QueueEvent;
use runq_protocol::QueuedRun;

/// Config tuned for fast tests: no persistence, quick polling, no autosave.
pub fn test_config() -> QueueConfig {
    QueueConfig {
        enable_persistence: false,
        autosave_interval: Duration::ZERO,
        worker_poll_interval: Duration::from_millis(10),
        ..QueueConfig::default()
    }
}

/// Streams a fixed chunk script, optionally pausing between chunks.
pub struct ScriptedExecutor {
    chunks: Vec<String>,
    chunk_delay: Duration,
}

impl ScriptedExecutor {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn with_delay(chunks: &[&str], chunk_delay: Duration) -> Self {
        Self {
            chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
            chunk_delay,
        }
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn stream(&self, _request: &ExecutionRequest) -> Result<ChunkStream, ExecutorError> {
        let delay = self.chunk_delay;
        let chunks = self.chunks.clone();
        Ok(Box::pin(futures::stream::iter(chunks).then(
            move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(chunk)
            },
        )))
    }

    async fn chat(&self, _request: &ExecutionRequest) -> Result<String, ExecutorError> {
        Ok(self.chunks.concat())
    }
}

/// Never produces a chunk; used to park a run in RUNNING until cancelled.
pub struct PendingExecutor;

#[async_trait]
impl AgentExecutor for PendingExecutor {
    async fn stream(&self, _request: &ExecutionRequest) -> Result<ChunkStream, ExecutorError> {
        Ok(Box::pin(futures::stream::pending()))
    }

    async fn chat(&self, _request: &ExecutionRequest) -> Result<String, ExecutorError> {
        std::future::pending::<()>().await;
        unreachable!("pending executor never resolves")
    }
}

/// Fails every run with a fixed message through the single-shot path.
pub struct FailingExecutor {
    pub message: String,
}

impl FailingExecutor {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl AgentExecutor for FailingExecutor {
    async fn chat(&self, _request: &ExecutionRequest) -> Result<String, ExecutorError> {
        Err(ExecutorError::failed(self.message.clone()))
    }
}

/// Produces some chunks, then aborts mid-stream.
pub struct MidStreamFailingExecutor;

#[async_trait]
impl AgentExecutor for MidStreamFailingExecutor {
    async fn stream(&self, _request: &ExecutionRequest) -> Result<ChunkStream, ExecutorError> {
        Ok(Box::pin(futures::stream::iter(vec![
            Ok("partial ".to_string()),
            Err(ExecutorError::failed("stream broke")),
        ])))
    }

    async fn chat(&self, _request: &ExecutionRequest) -> Result<String, ExecutorError> {
        Ok("full fallback output".to_string())
    }
}

/// Only implements the single-shot shape.
pub struct ChatOnlyExecutor {
    pub reply: String,
}

#[async_trait]
impl AgentExecutor for ChatOnlyExecutor {
    async fn chat(&self, _request: &ExecutionRequest) -> Result<String, ExecutorError> {
        Ok(self.reply.clone())
    }
}

/// Only implements the blocking-iterator shape.
pub struct IterExecutor {
    pub chunks: Vec<String>,
}

#[async_trait]
impl AgentExecutor for IterExecutor {
    fn stream_blocking(
        &self,
        _request: &ExecutionRequest,
    ) -> Result<runq_core::ChunkIter, ExecutorError> {
        Ok(Box::new(self.chunks.clone().into_iter().map(Ok)))
    }

    async fn chat(&self, _request: &ExecutionRequest) -> Result<String, ExecutorError> {
        Ok(self.chunks.concat())
    }
}

/// Records every callback for later assertions.
#[derive(Default)]
pub struct CollectListener {
    pub outputs: Mutex<Vec<(String, String)>>,
    pub completions: Mutex<Vec<QueuedRun>>,
    pub errors: Mutex<Vec<(String, String)>>,
    pub events: Mutex<Vec<QueueEvent>>,
}

impl CollectListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn event_kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.msg.to_string())
            .collect()
    }

    pub fn completion_count(&self) -> usize {
        self.completions.lock().unwrap().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

#[async_trait]
impl QueueListener for CollectListener {
    async fn on_output(&self, run_id: &str, chunk: &str) {
        self.outputs
            .lock()
            .unwrap()
            .push((run_id.to_string(), chunk.to_string()));
    }

    async fn on_complete(&self, _run_id: &str, run: &QueuedRun) {
        self.completions.lock().unwrap().push(run.clone());
    }

    async fn on_error(&self, run_id: &str, error: &QueueError) {
        self.errors
            .lock()
            .unwrap()
            .push((run_id.to_string(), error.to_string()));
    }

    fn on_event(&self, event: &QueueEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_terminal(manager: &QueueManager, run_id: &str) -> QueuedRun {
    wait_until("run to reach a terminal state", || {
        manager
            .get_run(run_id)
            .is_some_and(|run| run.state.is_terminal())
    })
    .await;
    manager.get_run(run_id).expect("run present")
}
