use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use runq_core::QueueConfig;
use runq_core::QueueManager;
use runq_core::SubmitRequest;
use runq_protocol::RunState;

use crate::suite::common::ChatOnlyExecutor;
use crate::suite::common::CollectListener;
use crate::suite::common::IterExecutor;
use crate::suite::common::MidStreamFailingExecutor;
use crate::suite::common::PendingExecutor;
use crate::suite::common::ScriptedExecutor;
use crate::suite::common::test_config;
use crate::suite::common::wait_terminal;
use crate::suite::common::wait_until;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overflowing_stream_drops_oldest_chunks() {
    let chunks: Vec<String> = (0..10).map(|n| format!("c{n}")).collect();
    let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
    let manager = QueueManager::new(
        QueueConfig {
            stream_buffer_size: 4,
            // First chunk is delayed so the test can grab the live buffer.
            ..test_config()
        },
        Arc::new(ScriptedExecutor::with_delay(
            &chunk_refs,
            Duration::from_millis(20),
        )),
        CollectListener::new(),
    );
    manager.start(false).await.expect("start");

    let run_id = manager
        .submit(SubmitRequest::new("x", "assistant"))
        .await
        .expect("submit");
    wait_until("buffer to appear", || {
        manager.stream_buffer(&run_id).is_some()
    })
    .await;
    let buffer = manager.stream_buffer(&run_id).expect("live buffer");

    let run = wait_terminal(&manager, &run_id).await;
    assert_eq!(run.state, RunState::Succeeded);

    // Capacity 4: the last four content chunks survive, plus the final
    // marker which is exempt from the drop policy.
    assert_eq!(buffer.dropped(), 6);
    let drained = buffer.drain_all();
    let indices: Vec<u64> = drained.iter().map(|chunk| chunk.chunk_index).collect();
    assert_eq!(indices, vec![6, 7, 8, 9, 10]);
    assert!(drained.last().is_some_and(|chunk| chunk.is_final));
    assert!(drained.iter().take(4).all(|chunk| !chunk.is_final));

    manager.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_only_executor_yields_single_synthetic_chunk() {
    let listener = CollectListener::new();
    let manager = QueueManager::new(
        test_config(),
        Arc::new(ChatOnlyExecutor {
            reply: "full reply".to_string(),
        }),
        listener.clone(),
    );
    manager.start(false).await.expect("start");

    let run_id = manager
        .submit(SubmitRequest::new("x", "assistant"))
        .await
        .expect("submit");
    let run = wait_terminal(&manager, &run_id).await;

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.output_content.as_deref(), Some("full reply"));
    assert_eq!(run.metrics["chunks"], serde_json::json!(1));

    let outputs = listener.outputs.lock().unwrap().clone();
    assert_eq!(outputs, vec![(run_id, "full reply".to_string())]);

    manager.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_iterator_executor_streams_chunk_by_chunk() {
    let listener = CollectListener::new();
    let manager = QueueManager::new(
        test_config(),
        Arc::new(IterExecutor {
            chunks: vec!["one ".to_string(), "two".to_string()],
        }),
        listener.clone(),
    );
    manager.start(false).await.expect("start");

    let run_id = manager
        .submit(SubmitRequest::new("x", "assistant"))
        .await
        .expect("submit");
    let run = wait_terminal(&manager, &run_id).await;

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.output_content.as_deref(), Some("one two"));
    assert_eq!(run.metrics["chunks"], serde_json::json!(2));
    assert_eq!(listener.outputs.lock().unwrap().len(), 2);

    manager.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mid_stream_failure_does_not_fall_back() {
    let listener = CollectListener::new();
    let manager = QueueManager::new(
        test_config(),
        Arc::new(MidStreamFailingExecutor),
        listener.clone(),
    );
    manager.start(false).await.expect("start");

    let run_id = manager
        .submit(SubmitRequest::new("x", "assistant"))
        .await
        .expect("submit");
    let run = wait_terminal(&manager, &run_id).await;

    // One chunk was produced, so the single-shot fallback is off the table.
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error.as_deref(), Some("stream broke"));

    wait_until("error callback", || listener.error_count() == 1).await;
    assert_eq!(listener.completion_count(), 0);

    manager.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_timeout_fails_stuck_executor() {
    let listener = CollectListener::new();
    let manager = QueueManager::new(
        QueueConfig {
            run_timeout: Some(Duration::from_millis(100)),
            ..test_config()
        },
        Arc::new(PendingExecutor),
        listener.clone(),
    );
    manager.start(false).await.expect("start");

    let run_id = manager
        .submit(SubmitRequest::new("x", "assistant"))
        .await
        .expect("submit");
    let run = wait_terminal(&manager, &run_id).await;

    assert_eq!(run.state, RunState::Failed);
    assert!(
        run.error.as_deref().is_some_and(|error| error.contains("timeout")),
        "error should mention the timeout: {:?}",
        run.error
    );
    wait_until("error callback", || listener.error_count() == 1).await;

    manager.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_shutdown_cancels_inflight_runs() {
    let manager = QueueManager::new(
        test_config(),
        Arc::new(PendingExecutor),
        CollectListener::new(),
    );
    manager.start(false).await.expect("start");

    let run_id = manager
        .submit(SubmitRequest::new("x", "assistant"))
        .await
        .expect("submit");
    wait_until("run to start", || {
        manager
            .get_run(&run_id)
            .is_some_and(|run| run.state == RunState::Running)
    })
    .await;

    manager.stop(Duration::from_millis(200)).await;

    let run = manager.get_run(&run_id).expect("run present");
    assert_eq!(run.state, RunState::Cancelled);
    assert!(run.ended_at.is_some());
}
