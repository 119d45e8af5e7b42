use anyhow::Result;
use chrono::Utc;
use runq_protocol::QueueStats;
use runq_protocol::QueuedRun;
use runq_protocol::RunState;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;

use crate::INTERRUPTED_ERROR;
use crate::model::RunFilter;
use crate::model::RunRow;
use crate::model::datetime_to_epoch_seconds;

use super::QueueStore;

const DEFAULT_LIST_LIMIT: usize = 100;

fn json_map_to_column(map: &serde_json::Map<String, serde_json::Value>) -> Result<Option<String>> {
    if map.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(map)?))
    }
}

impl QueueStore {
    /// Upsert a run by id. Safe to call repeatedly; the `recovered` flag is
    /// only ever set through [`QueueStore::mark_recovered`] and survives
    /// subsequent saves.
    pub async fn save_run(&self, run: &QueuedRun) -> Result<()> {
        let config_json = json_map_to_column(&run.config)?;
        let metrics_json = json_map_to_column(&run.metrics)?;
        sqlx::query(
            r#"
INSERT INTO runs (
    run_id,
    agent_name,
    input_content,
    output_content,
    state,
    priority,
    session_id,
    trace_id,
    workspace,
    user_id,
    created_at,
    started_at,
    ended_at,
    error,
    retry_count,
    max_retries,
    parent_run_id,
    config_json,
    metrics_json
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(run_id) DO UPDATE SET
    agent_name = excluded.agent_name,
    input_content = excluded.input_content,
    output_content = excluded.output_content,
    state = excluded.state,
    priority = excluded.priority,
    session_id = excluded.session_id,
    trace_id = excluded.trace_id,
    workspace = excluded.workspace,
    user_id = excluded.user_id,
    created_at = excluded.created_at,
    started_at = excluded.started_at,
    ended_at = excluded.ended_at,
    error = excluded.error,
    retry_count = excluded.retry_count,
    max_retries = excluded.max_retries,
    parent_run_id = excluded.parent_run_id,
    config_json = excluded.config_json,
    metrics_json = excluded.metrics_json
            "#,
        )
        .bind(run.run_id.as_str())
        .bind(run.agent_name.as_str())
        .bind(run.input_content.as_str())
        .bind(run.output_content.as_deref())
        .bind(run.state.as_str())
        .bind(run.priority.as_i64())
        .bind(run.session_id.as_deref())
        .bind(run.trace_id.as_deref())
        .bind(run.workspace.as_deref())
        .bind(run.user_id.as_deref())
        .bind(datetime_to_epoch_seconds(run.created_at))
        .bind(run.started_at.map(datetime_to_epoch_seconds))
        .bind(run.ended_at.map(datetime_to_epoch_seconds))
        .bind(run.error.as_deref())
        .bind(i64::from(run.retry_count))
        .bind(i64::from(run.max_retries))
        .bind(run.parent_run_id.as_deref())
        .bind(config_json)
        .bind(metrics_json)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn load_run(&self, run_id: &str) -> Result<Option<QueuedRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
SELECT
    run_id,
    agent_name,
    input_content,
    output_content,
    state,
    priority,
    session_id,
    trace_id,
    workspace,
    user_id,
    created_at,
    started_at,
    ended_at,
    error,
    retry_count,
    max_retries,
    parent_run_id,
    config_json,
    metrics_json
FROM runs
WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(QueuedRun::try_from).transpose()
    }

    /// List runs matching `filter`, ordered by priority descending then
    /// submission time ascending.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<QueuedRun>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            r#"
SELECT
    run_id,
    agent_name,
    input_content,
    output_content,
    state,
    priority,
    session_id,
    trace_id,
    workspace,
    user_id,
    created_at,
    started_at,
    ended_at,
    error,
    retry_count,
    max_retries,
    parent_run_id,
    config_json,
    metrics_json
FROM runs
WHERE 1 = 1
            "#,
        );
        if let Some(state) = filter.state {
            builder.push(" AND state = ");
            builder.push_bind(state.as_str());
        }
        if let Some(session_id) = filter.session_id.as_deref() {
            builder.push(" AND session_id = ");
            builder.push_bind(session_id);
        }
        if let Some(workspace) = filter.workspace.as_deref() {
            builder.push(" AND workspace = ");
            builder.push_bind(workspace);
        }
        builder.push(" ORDER BY priority DESC, created_at ASC LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT) as i64);
        builder.push(" OFFSET ");
        builder.push_bind(filter.offset.unwrap_or(0) as i64);
        let rows: Vec<RunRow> = builder
            .build_query_as::<RunRow>()
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(QueuedRun::try_from).collect()
    }

    /// Every run that was QUEUED or RUNNING at call time, in dispatch order.
    pub async fn load_pending(&self) -> Result<Vec<QueuedRun>> {
        let rows: Vec<RunRow> = sqlx::query_as::<_, RunRow>(
            r#"
SELECT
    run_id,
    agent_name,
    input_content,
    output_content,
    state,
    priority,
    session_id,
    trace_id,
    workspace,
    user_id,
    created_at,
    started_at,
    ended_at,
    error,
    retry_count,
    max_retries,
    parent_run_id,
    config_json,
    metrics_json
FROM runs
WHERE state IN (?, ?)
ORDER BY priority DESC, created_at ASC
            "#,
        )
        .bind(RunState::Queued.as_str())
        .bind(RunState::Running.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(QueuedRun::try_from).collect()
    }

    /// Crash recovery: atomically fail every record still marked RUNNING.
    /// Returns the number of runs converted.
    pub async fn mark_interrupted_as_failed(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
UPDATE runs
SET state = ?, error = ?, ended_at = ?
WHERE state = ?
            "#,
        )
        .bind(RunState::Failed.as_str())
        .bind(INTERRUPTED_ERROR)
        .bind(now)
        .bind(RunState::Running.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_recovered(&self, run_id: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET recovered = 1 WHERE run_id = ?")
            .bind(run_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn was_recovered(&self, run_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT recovered FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let recovered: i64 = row.try_get("recovered")?;
        Ok(recovered != 0)
    }

    /// Targeted state update used by the CLI when no manager is running.
    /// Stamps `started_at` on RUNNING and `ended_at` on terminal states.
    pub async fn update_run_state(
        &self,
        run_id: &str,
        state: RunState,
        error: Option<&str>,
        output: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE runs SET state = ");
        builder.push_bind(state.as_str());
        if state == RunState::Running {
            builder.push(", started_at = ");
            builder.push_bind(now);
        } else if state.is_terminal() {
            builder.push(", ended_at = ");
            builder.push_bind(now);
        }
        if let Some(error) = error {
            builder.push(", error = ");
            builder.push_bind(error);
        }
        if let Some(output) = output {
            builder.push(", output_content = ");
            builder.push_bind(output);
        }
        builder.push(" WHERE run_id = ");
        builder.push_bind(run_id);
        let result = builder.build().execute(self.pool()).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM runs WHERE run_id = ?")
            .bind(run_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete terminal runs older than the cutoff. Returns the number of
    /// rows removed.
    pub async fn cleanup(&self, older_than_days: u32) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - i64::from(older_than_days) * 24 * 60 * 60;
        let result = sqlx::query(
            r#"
DELETE FROM runs
WHERE created_at < ? AND state IN (?, ?, ?)
            "#,
        )
        .bind(cutoff)
        .bind(RunState::Succeeded.as_str())
        .bind(RunState::Failed.as_str())
        .bind(RunState::Cancelled.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Aggregate counts and averages, optionally scoped to one session.
    pub async fn stats(&self, session_id: Option<&str>) -> Result<QueueStats> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT state, COUNT(*) AS count FROM runs WHERE 1 = 1");
        if let Some(session_id) = session_id {
            builder.push(" AND session_id = ");
            builder.push_bind(session_id);
        }
        builder.push(" GROUP BY state");
        let rows = builder.build().fetch_all(self.pool()).await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            let count = u64::try_from(count).unwrap_or_default();
            stats.total_runs += count;
            match RunState::parse(state.as_str()) {
                Some(RunState::Queued) => stats.queued_count = count,
                Some(RunState::Running) | Some(RunState::Paused) => stats.running_count += count,
                Some(RunState::Succeeded) => stats.succeeded_count = count,
                Some(RunState::Failed) => stats.failed_count = count,
                Some(RunState::Cancelled) => stats.cancelled_count = count,
                None => {}
            }
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT AVG(started_at - created_at) AS avg_wait FROM runs WHERE started_at IS NOT NULL",
        );
        if let Some(session_id) = session_id {
            builder.push(" AND session_id = ");
            builder.push_bind(session_id);
        }
        let row = builder.build().fetch_one(self.pool()).await?;
        stats.avg_wait_seconds = row.try_get::<Option<f64>, _>("avg_wait")?.unwrap_or(0.0);

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT AVG(ended_at - started_at) AS avg_duration FROM runs WHERE ended_at IS NOT NULL AND started_at IS NOT NULL",
        );
        if let Some(session_id) = session_id {
            builder.push(" AND session_id = ");
            builder.push_bind(session_id);
        }
        let row = builder.build().fetch_one(self.pool()).await?;
        stats.avg_duration_seconds = row
            .try_get::<Option<f64>, _>("avg_duration")?
            .unwrap_or(0.0);

        Ok(stats)
    }
}
