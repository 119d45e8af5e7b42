use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use runq_protocol::ChatMessage;
use serde_json::Map;
use serde_json::Value;

use crate::error::ExecutorError;
use crate::tools::ExecutorTool;

/// Lazy async chunk source: the preferred executor shape.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ExecutorError>> + Send>>;

/// Synchronous chunk iterable: the second shape, adapted by the worker with
/// a cooperative yield between chunks.
pub type ChunkIter = Box<dyn Iterator<Item = Result<String, ExecutorError>> + Send>;

/// Everything an executor needs to produce output for one run.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub run_id: String,
    pub agent_name: String,
    pub input: String,
    pub config: Map<String, Value>,
    pub session_id: Option<String>,
    pub chat_history: Vec<ChatMessage>,
    /// Runtime-only tool handles looked up from the registry; never part of
    /// the persisted record.
    pub tools: Vec<Arc<dyn ExecutorTool>>,
}

/// The seam to the agent runtime.
///
/// The worker tries [`AgentExecutor::stream`] first, then
/// [`AgentExecutor::stream_blocking`], then [`AgentExecutor::chat`] as a
/// single non-streaming shot. An implementation only has to provide `chat`;
/// the streaming shapes default to [`ExecutorError::Unsupported`].
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn stream(&self, request: &ExecutionRequest) -> Result<ChunkStream, ExecutorError> {
        let _ = request;
        Err(ExecutorError::Unsupported)
    }

    fn stream_blocking(&self, request: &ExecutionRequest) -> Result<ChunkIter, ExecutorError> {
        let _ = request;
        Err(ExecutorError::Unsupported)
    }

    async fn chat(&self, request: &ExecutionRequest) -> Result<String, ExecutorError>;
}
