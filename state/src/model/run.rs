use anyhow::Result;
use runq_protocol::QueuedRun;
use runq_protocol::RunPriority;
use runq_protocol::RunState;
use serde_json::Map;
use serde_json::Value;

use super::epoch_seconds_to_datetime;

/// Filters for [`crate::QueueStore::list_runs`]. `Default` lists the most
/// recent 100 rows unfiltered.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub state: Option<RunState>,
    pub session_id: Option<String>,
    pub workspace: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl RunFilter {
    pub fn with_state(state: RunState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunRow {
    pub(crate) run_id: String,
    pub(crate) agent_name: String,
    pub(crate) input_content: Option<String>,
    pub(crate) output_content: Option<String>,
    pub(crate) state: String,
    pub(crate) priority: i64,
    pub(crate) session_id: Option<String>,
    pub(crate) trace_id: Option<String>,
    pub(crate) workspace: Option<String>,
    pub(crate) user_id: Option<String>,
    pub(crate) created_at: i64,
    pub(crate) started_at: Option<i64>,
    pub(crate) ended_at: Option<i64>,
    pub(crate) error: Option<String>,
    pub(crate) retry_count: i64,
    pub(crate) max_retries: i64,
    pub(crate) parent_run_id: Option<String>,
    pub(crate) config_json: Option<String>,
    pub(crate) metrics_json: Option<String>,
}

fn parse_json_map(raw: Option<&str>) -> Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(text) => Ok(serde_json::from_str(text)?),
    }
}

impl TryFrom<RunRow> for QueuedRun {
    type Error = anyhow::Error;

    fn try_from(value: RunRow) -> Result<Self, Self::Error> {
        let state = RunState::parse(value.state.as_str())
            .ok_or_else(|| anyhow::anyhow!("invalid run state: {}", value.state))?;
        let priority = RunPriority::from_i64(value.priority)
            .ok_or_else(|| anyhow::anyhow!("invalid run priority: {}", value.priority))?;
        Ok(Self {
            run_id: value.run_id,
            agent_name: value.agent_name,
            input_content: value.input_content.unwrap_or_default(),
            state,
            priority,
            session_id: value.session_id,
            trace_id: value.trace_id,
            workspace: value.workspace,
            user_id: value.user_id,
            created_at: epoch_seconds_to_datetime(value.created_at)?,
            started_at: value
                .started_at
                .map(epoch_seconds_to_datetime)
                .transpose()?,
            ended_at: value.ended_at.map(epoch_seconds_to_datetime).transpose()?,
            output_content: value.output_content,
            error: value.error,
            metrics: parse_json_map(value.metrics_json.as_deref())?,
            retry_count: u32::try_from(value.retry_count).unwrap_or_default(),
            max_retries: u32::try_from(value.max_retries).unwrap_or_default(),
            parent_run_id: value.parent_run_id,
            config: parse_json_map(value.config_json.as_deref())?,
            // Chat history is runtime-only context and is never persisted.
            chat_history: Vec::new(),
        })
    }
}
