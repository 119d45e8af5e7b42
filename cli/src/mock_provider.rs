//! Deterministic built-in provider backing the one-shot `run` command.
//!
//! Real agent runtimes plug in through [`runq_core::AgentExecutor`]; this
//! provider exists so the CLI works end-to-end out of the box. Responses are
//! canned per input pattern and streamed in small word groups with a short
//! delay, which is also what makes it useful for exercising the queue's
//! streaming path interactively.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use runq_core::AgentExecutor;
use runq_core::ChunkStream;
use runq_core::ExecutionRequest;
use runq_core::ExecutorError;

const WORDS_PER_CHUNK: usize = 3;
const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// One canned reply: full content plus its pre-split chunk sequence.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub content: String,
    pub chunks: Vec<String>,
    pub error: Option<String>,
}

impl MockResponse {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            chunks: word_chunks(content),
            error: None,
        }
    }

    pub fn failure(message: &str) -> Self {
        Self {
            content: String::new(),
            chunks: Vec::new(),
            error: Some(message.to_string()),
        }
    }
}

/// Split content into groups of a few words each; every chunk after the
/// first carries its separating space so concatenation reproduces the
/// original text.
fn word_chunks(content: &str) -> Vec<String> {
    let words: Vec<&str> = content.split_whitespace().collect();
    words
        .chunks(WORDS_PER_CHUNK)
        .enumerate()
        .map(|(group, words)| {
            let mut chunk = words.join(" ");
            if group > 0 {
                chunk.insert(0, ' ');
            }
            chunk
        })
        .collect()
}

/// Canned responses selected by substring match on the input.
pub struct MockProvider {
    responses: HashMap<&'static str, MockResponse>,
    default_response: MockResponse,
    chunk_delay: Duration,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        let mut responses = HashMap::new();
        responses.insert(
            "hello",
            MockResponse::text("Hello! I'm the built-in mock assistant. How can I help you today?"),
        );
        responses.insert(
            "help",
            MockResponse::text(
                "I can demonstrate queueing, streaming and retries. Just ask me anything!",
            ),
        );
        responses.insert(
            "test",
            MockResponse::text("This is a canned test response. Everything is working correctly."),
        );
        responses.insert("error", MockResponse::failure("simulated provider failure"));
        Self {
            responses,
            default_response: MockResponse::text(
                "I understand your request. This is a deterministic canned reply produced by \
                 the built-in mock provider; plug a real executor into the library API for \
                 actual agent output.",
            ),
            chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }

    pub fn with_chunk_delay(mut self, chunk_delay: Duration) -> Self {
        self.chunk_delay = chunk_delay;
        self
    }

    pub fn response_for(&self, input: &str) -> &MockResponse {
        let input = input.to_lowercase();
        self.responses
            .iter()
            .find(|(pattern, _)| input.contains(*pattern))
            .map(|(_, response)| response)
            .unwrap_or(&self.default_response)
    }
}

/// [`AgentExecutor`] over a [`MockProvider`].
pub struct MockExecutor {
    provider: MockProvider,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new(MockProvider::new())
    }
}

impl MockExecutor {
    pub fn new(provider: MockProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl AgentExecutor for MockExecutor {
    async fn stream(&self, request: &ExecutionRequest) -> Result<ChunkStream, ExecutorError> {
        let response = self.provider.response_for(&request.input);
        if let Some(error) = &response.error {
            return Err(ExecutorError::failed(error.clone()));
        }
        let delay = self.provider.chunk_delay;
        let chunks = response.chunks.clone();
        Ok(Box::pin(futures::stream::iter(chunks).then(
            move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(chunk)
            },
        )))
    }

    async fn chat(&self, request: &ExecutionRequest) -> Result<String, ExecutorError> {
        let response = self.provider.response_for(&request.input);
        if let Some(error) = &response.error {
            return Err(ExecutorError::failed(error.clone()));
        }
        Ok(response.content.clone())
    }
}
