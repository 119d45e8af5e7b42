#[cfg(test)]
use chrono::DateTime;
#[cfg(test)]
use chrono::Utc;
#[cfg(test)]
use runq_protocol::QueuedRun;
#[cfg(test)]
use runq_protocol::RunPriority;
#[cfg(test)]
use runq_protocol::RunState;
#[cfg(test)]
use tempfile::TempDir;

#[cfg(test)]
use crate::QueueStore;

#[cfg(test)]
pub(super) async fn open_temp_store() -> (QueueStore, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let store = QueueStore::open(&dir.path().join("queue.sqlite"))
        .await
        .expect("open store");
    (store, dir)
}

/// A run with a deterministic timestamp, offset in seconds from a fixed
/// base so tests can control relative ordering.
#[cfg(test)]
pub(super) fn sample_run(
    run_id: &str,
    state: RunState,
    priority: RunPriority,
    created_offset_secs: i64,
) -> QueuedRun {
    let created = DateTime::<Utc>::from_timestamp(1_700_000_000 + created_offset_secs, 0)
        .expect("timestamp");
    let mut run = QueuedRun::new("assistant", format!("input for {run_id}"));
    run.run_id = run_id.to_string();
    run.state = state;
    run.priority = priority;
    run.created_at = created;
    run
}
