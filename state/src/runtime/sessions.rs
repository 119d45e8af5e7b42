use anyhow::Result;
use chrono::Utc;
use serde_json::Value;

use crate::model::SessionRecord;
use crate::model::SessionRow;

use super::QueueStore;

impl QueueStore {
    /// Atomic upsert. Fields passed as `None` keep their stored value, so a
    /// state-only save never clobbers an earlier config blob.
    pub async fn save_session(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        state: Option<&Value>,
        config: Option<&Value>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let state_json = state.map(serde_json::to_string).transpose()?;
        let config_json = config.map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
INSERT INTO sessions (session_id, user_id, created_at, updated_at, state_json, config_json)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT(session_id) DO UPDATE SET
    user_id = COALESCE(excluded.user_id, user_id),
    updated_at = excluded.updated_at,
    state_json = COALESCE(excluded.state_json, state_json),
    config_json = COALESCE(excluded.config_json, config_json)
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .bind(state_json)
        .bind(config_json)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
SELECT session_id, user_id, created_at, updated_at, state_json, config_json
FROM sessions
WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(SessionRecord::try_from).transpose()
    }

    /// Most recently touched sessions first.
    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as::<_, SessionRow>(
            r#"
SELECT session_id, user_id, created_at, updated_at, state_json, config_json
FROM sessions
ORDER BY updated_at DESC
LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(SessionRecord::try_from).collect()
    }
}
