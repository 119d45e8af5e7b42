use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use runq_core::QueueConfig;
use runq_core::QueueManager;
use runq_core::QueueScheduler;
use runq_core::SubmitRequest;
use runq_protocol::QueuedRun;
use runq_protocol::RunState;
use runq_state::INTERRUPTED_ERROR;
use runq_state::QueueStore;
use tempfile::TempDir;

use crate::suite::common::CollectListener;
use crate::suite::common::PendingExecutor;
use crate::suite::common::ScriptedExecutor;
use crate::suite::common::test_config;
use crate::suite::common::wait_terminal;

fn persistent_config(dir: &TempDir) -> QueueConfig {
    QueueConfig {
        enable_persistence: true,
        store_path: dir.path().join("queue.sqlite"),
        ..test_config()
    }
}

fn stored_run(run_id: &str, state: RunState) -> QueuedRun {
    let mut run = QueuedRun::new("assistant", format!("input for {run_id}"));
    run.run_id = run_id.to_string();
    run.state = state;
    if state == RunState::Running {
        run.started_at = Some(Utc::now());
    }
    run
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_fails_interrupted_and_requeues_queued() {
    let dir = TempDir::new().expect("temp dir");
    let store_path = dir.path().join("queue.sqlite");

    // Simulate the previous process: five persisted runs, two of them
    // mid-execution when it died.
    let store = QueueStore::open(&store_path).await.expect("open store");
    for run_id in ["run-1", "run-2", "run-3"] {
        store
            .save_run(&stored_run(run_id, RunState::Queued))
            .await
            .expect("save");
    }
    for run_id in ["run-4", "run-5"] {
        store
            .save_run(&stored_run(run_id, RunState::Running))
            .await
            .expect("save");
    }
    store.close().await;

    // Restart with a parked executor so the requeued runs stay observable.
    let manager = QueueManager::new(
        persistent_config(&dir),
        Arc::new(PendingExecutor),
        CollectListener::new(),
    );
    manager.start(true).await.expect("start");

    let store = QueueStore::open(&store_path).await.expect("reopen store");
    for run_id in ["run-4", "run-5"] {
        let run = store
            .load_run(run_id)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert!(run.ended_at.is_some());
        assert!(!store.was_recovered(run_id).await.expect("flag"));
    }
    for run_id in ["run-1", "run-2", "run-3"] {
        assert!(store.was_recovered(run_id).await.expect("flag"));
        let live = manager.get_run(run_id).expect("recovered in scheduler");
        assert!(live.state.is_active());
    }

    // Nothing persisted as RUNNING survives in a non-terminal state.
    let failed = manager
        .get_run("run-4")
        .map(|run| run.state)
        .unwrap_or(RunState::Failed);
    assert_eq!(failed, RunState::Failed);

    manager.stop(Duration::from_millis(200)).await;
    store.close().await;
}

#[tokio::test]
async fn submit_round_trips_through_store_into_new_scheduler() {
    let dir = TempDir::new().expect("temp dir");
    let store = QueueStore::open(&dir.path().join("queue.sqlite"))
        .await
        .expect("open store");

    let run = stored_run("round-trip", RunState::Queued);
    store.save_run(&run).await.expect("save");

    let pending = store.load_pending().await.expect("pending");
    assert_eq!(pending.len(), 1);

    // A fresh process: new scheduler ingests the pending set and dispatches.
    let scheduler = QueueScheduler::new(test_config());
    scheduler.load_runs(pending);
    let dispatched = scheduler.next().expect("dispatchable run");
    assert_eq!(dispatched.run_id, "round-trip");
    assert_eq!(dispatched.state, RunState::Running);

    store.close().await;
}

/// The store record must be terminal before the user's completion callback
/// observes the run.
struct StoreCheckingListener {
    store_path: std::path::PathBuf,
    persisted_before_callback: Mutex<Vec<bool>>,
}

#[async_trait]
impl runq_core::QueueListener for StoreCheckingListener {
    async fn on_complete(&self, run_id: &str, _run: &QueuedRun) {
        let persisted = match QueueStore::open(&self.store_path).await {
            Ok(store) => {
                let state = store
                    .load_run(run_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|run| run.state);
                store.close().await;
                state == Some(RunState::Succeeded)
            }
            Err(_) => false,
        };
        self.persisted_before_callback.lock().unwrap().push(persisted);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminal_record_is_durable_before_notification() {
    let dir = TempDir::new().expect("temp dir");
    let store_path = dir.path().join("queue.sqlite");
    let listener = Arc::new(StoreCheckingListener {
        store_path: store_path.clone(),
        persisted_before_callback: Mutex::new(Vec::new()),
    });

    let manager = QueueManager::new(
        QueueConfig {
            enable_persistence: true,
            store_path,
            ..test_config()
        },
        Arc::new(ScriptedExecutor::new(&["ok"])),
        listener.clone(),
    );
    manager.start(false).await.expect("start");

    let run_id = manager
        .submit(SubmitRequest::new("x", "assistant"))
        .await
        .expect("submit");
    wait_terminal(&manager, &run_id).await;

    crate::suite::common::wait_until("completion callback", || {
        !listener.persisted_before_callback.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(
        listener.persisted_before_callback.lock().unwrap().clone(),
        vec![true]
    );

    manager.stop(Duration::from_secs(2)).await;
}
