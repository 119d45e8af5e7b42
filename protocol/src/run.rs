use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use uuid::Uuid;

/// Mint a fresh short run id. Eight hex characters are plenty within a
/// single store and keep ids readable in terminal output.
pub fn new_run_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Queued,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub const fn as_str(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are absorbing: no transition leads out of them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority levels for queued runs. Higher value = dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl RunPriority {
    /// Dispatch scan order: urgent first.
    pub const DESCENDING: [RunPriority; 4] = [
        RunPriority::Urgent,
        RunPriority::High,
        RunPriority::Normal,
        RunPriority::Low,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            RunPriority::Low => "low",
            RunPriority::Normal => "normal",
            RunPriority::High => "high",
            RunPriority::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }

    pub const fn as_i64(self) -> i64 {
        match self {
            RunPriority::Low => 0,
            RunPriority::Normal => 1,
            RunPriority::High => 2,
            RunPriority::Urgent => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            3 => Some(Self::Urgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message of prior conversation handed to the executor for context
/// continuity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A single queued agent run: payload, routing, lifecycle bookkeeping and
/// outcome. The scheduler owns the mutable record while the run is active;
/// everyone else sees snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRun {
    pub run_id: String,
    pub agent_name: String,
    pub input_content: String,

    pub state: RunState,
    pub priority: RunPriority,

    pub session_id: Option<String>,
    pub trace_id: Option<String>,
    pub workspace: Option<String>,
    pub user_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    pub output_content: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: Map<String, Value>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub parent_run_id: Option<String>,

    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
}

impl QueuedRun {
    pub fn new(agent_name: impl Into<String>, input_content: impl Into<String>) -> Self {
        Self {
            run_id: new_run_id(),
            agent_name: agent_name.into(),
            input_content: input_content.into(),
            state: RunState::Queued,
            priority: RunPriority::Normal,
            session_id: None,
            trace_id: None,
            workspace: None,
            user_id: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            output_content: None,
            error: None,
            metrics: Map::new(),
            retry_count: 0,
            max_retries: 3,
            parent_run_id: None,
            config: Map::new(),
            chat_history: Vec::new(),
        }
    }

    /// Wall-clock execution time so far, or total for an ended run. `None`
    /// until the run has started.
    pub fn duration(&self) -> Option<TimeDelta> {
        let started = self.started_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - started)
    }

    /// Time spent waiting in the queue before dispatch.
    pub fn wait_time(&self) -> TimeDelta {
        self.started_at.unwrap_or_else(Utc::now) - self.created_at
    }

    pub fn can_retry(&self) -> bool {
        self.state == RunState::Failed && self.retry_count < self.max_retries
    }
}

/// One incremental fragment of a run's streamed output.
///
/// Chunk indices are strictly increasing from 0 within a run; exactly one
/// chunk per completed run carries `is_final`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub run_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub chunk_index: u64,
    pub is_final: bool,
}

impl StreamChunk {
    pub fn new(run_id: impl Into<String>, content: impl Into<String>, chunk_index: u64) -> Self {
        Self {
            run_id: run_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            chunk_index,
            is_final: false,
        }
    }

    pub fn final_marker(run_id: impl Into<String>, chunk_index: u64) -> Self {
        Self {
            run_id: run_id.into(),
            content: String::new(),
            timestamp: Utc::now(),
            chunk_index,
            is_final: true,
        }
    }
}
