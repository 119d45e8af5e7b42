use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::RunPriority;

/// An event emitted by the scheduler on every state transition.
///
/// Delivery is synchronous on the transitioning thread, after the scheduler
/// lock has been released; listeners must not block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub msg: QueueEventMsg,
}

impl QueueEvent {
    pub fn new(run_id: impl Into<String>, msg: QueueEventMsg) -> Self {
        Self {
            run_id: run_id.into(),
            timestamp: Utc::now(),
            msg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Display)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueEventMsg {
    RunSubmitted {
        priority: RunPriority,
        agent: String,
    },
    RunStarted {
        agent: String,
    },
    RunCompleted {
        duration_seconds: Option<f64>,
    },
    RunFailed {
        error: String,
    },
    RunCancelled {
        was_running: bool,
    },
    RunPaused,
    RunResumed,
    RunUpdated,
    RunRetried {
        parent_run_id: String,
        retry_count: u32,
    },
}
