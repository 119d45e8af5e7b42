use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;

use super::epoch_seconds_to_datetime;

/// A persisted session: a grouping id for runs plus opaque state and config
/// blobs owned by the client. Sessions outlive individual runs and are never
/// garbage-collected automatically.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: Option<Value>,
    pub config: Option<Value>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SessionRow {
    pub(crate) session_id: String,
    pub(crate) user_id: Option<String>,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
    pub(crate) state_json: Option<String>,
    pub(crate) config_json: Option<String>,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = anyhow::Error;

    fn try_from(value: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            session_id: value.session_id,
            user_id: value.user_id,
            created_at: epoch_seconds_to_datetime(value.created_at)?,
            updated_at: epoch_seconds_to_datetime(value.updated_at)?,
            state: value
                .state_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            config: value
                .config_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}
