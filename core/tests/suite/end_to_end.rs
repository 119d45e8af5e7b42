use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use runq_core::QueueConfig;
use runq_core::QueueError;
use runq_core::QueueManager;
use runq_core::SubmitRequest;
use runq_protocol::QueueEventMsg;
use runq_protocol::RunPriority;
use runq_protocol::RunState;

use crate::suite::common::CollectListener;
use crate::suite::common::FailingExecutor;
use crate::suite::common::PendingExecutor;
use crate::suite::common::ScriptedExecutor;
use crate::suite::common::test_config;
use crate::suite::common::wait_terminal;
use crate::suite::common::wait_until;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_run_succeeds_with_accumulated_output() {
    let listener = CollectListener::new();
    let manager = QueueManager::new(
        QueueConfig {
            max_concurrent_global: 2,
            ..test_config()
        },
        Arc::new(ScriptedExecutor::new(&["hi ", "world"])),
        listener.clone(),
    );
    manager.start(false).await.expect("start");

    let run_id = manager
        .submit(SubmitRequest::new("x", "assistant"))
        .await
        .expect("submit");
    let run = wait_terminal(&manager, &run_id).await;

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.output_content.as_deref(), Some("hi world"));
    assert_eq!(run.metrics["chunks"], serde_json::json!(2));
    assert!(run.started_at.is_some());
    assert!(run.ended_at.is_some());

    wait_until("completion callback", || listener.completion_count() == 1).await;
    assert_eq!(listener.completion_count(), 1);
    let outputs = listener.outputs.lock().unwrap().clone();
    assert_eq!(
        outputs,
        vec![
            (run_id.clone(), "hi ".to_string()),
            (run_id.clone(), "world".to_string()),
        ]
    );

    manager.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn urgent_run_starts_before_low() {
    let listener = CollectListener::new();
    let manager = QueueManager::new(
        QueueConfig {
            max_concurrent_global: 1,
            ..test_config()
        },
        Arc::new(ScriptedExecutor::new(&["done"])),
        listener.clone(),
    );

    // Submit before the workers exist so dispatch order is decided purely by
    // priority.
    let low = manager
        .submit(SubmitRequest {
            priority: Some(RunPriority::Low),
            ..SubmitRequest::new("first", "assistant")
        })
        .await
        .expect("submit low");
    let urgent = manager
        .submit(SubmitRequest {
            priority: Some(RunPriority::Urgent),
            ..SubmitRequest::new("second", "assistant")
        })
        .await
        .expect("submit urgent");

    manager.start(false).await.expect("start");
    wait_terminal(&manager, &low).await;
    wait_terminal(&manager, &urgent).await;

    let started: Vec<String> = listener
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event.msg, QueueEventMsg::RunStarted { .. }))
        .map(|event| event.run_id.clone())
        .collect();
    assert_eq!(started, vec![urgent, low]);

    manager.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_agent_cap_holds_back_second_run() {
    let listener = CollectListener::new();
    let manager = QueueManager::new(
        QueueConfig {
            max_concurrent_global: 4,
            max_concurrent_per_agent: 1,
            ..test_config()
        },
        Arc::new(PendingExecutor),
        listener,
    );
    manager.start(false).await.expect("start");

    let a1 = manager
        .submit(SubmitRequest::new("1", "agent-a"))
        .await
        .expect("submit");
    let a2 = manager
        .submit(SubmitRequest::new("2", "agent-a"))
        .await
        .expect("submit");
    let b = manager
        .submit(SubmitRequest::new("3", "agent-b"))
        .await
        .expect("submit");

    wait_until("two runs running", || manager.running_count() == 2).await;
    // Give the pool a chance to (incorrectly) dispatch the capped run.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let running: Vec<String> = manager
        .running_runs()
        .into_iter()
        .map(|run| run.run_id)
        .collect();
    assert!(running.contains(&b));
    let a_running = usize::from(running.contains(&a1)) + usize::from(running.contains(&a2));
    assert_eq!(a_running, 1, "exactly one agent-a run may hold the cap");
    assert_eq!(manager.queued_count(), 1);

    manager.stop(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_running_run_is_final() {
    let listener = CollectListener::new();
    let manager = QueueManager::new(
        test_config(),
        Arc::new(PendingExecutor),
        listener.clone(),
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

    assert!(manager.cancel(&run_id).await);
    let run = manager.get_run(&run_id).expect("run present");
    assert_eq!(run.state, RunState::Cancelled);
    assert!(run.ended_at.is_some());

    // No complete or fail may arrive afterwards.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(listener.completion_count(), 0);
    assert_eq!(listener.error_count(), 0);

    let cancelled_events: Vec<bool> = listener
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event.msg {
            QueueEventMsg::RunCancelled { was_running } => Some(was_running),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled_events, vec![true]);

    // Double cancel is a no-op.
    assert!(!manager.cancel(&run_id).await);

    manager.stop(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_chain_stops_at_max_retries() {
    let listener = CollectListener::new();
    let manager = QueueManager::new(
        QueueConfig {
            default_max_retries: 2,
            ..test_config()
        },
        Arc::new(FailingExecutor::new("deterministic failure")),
        listener.clone(),
    );
    manager.start(false).await.expect("start");

    let root = manager
        .submit(SubmitRequest::new("x", "assistant"))
        .await
        .expect("submit");
    let run = wait_terminal(&manager, &root).await;
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error.as_deref(), Some("deterministic failure"));
    assert_eq!(run.retry_count, 0);

    let first_retry = manager.retry(&root).await.expect("first retry");
    let run = wait_terminal(&manager, &first_retry).await;
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.retry_count, 1);
    assert_eq!(run.parent_run_id.as_deref(), Some(root.as_str()));

    let second_retry = manager.retry(&first_retry).await.expect("second retry");
    let run = wait_terminal(&manager, &second_retry).await;
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.retry_count, 2);
    assert_eq!(run.parent_run_id.as_deref(), Some(first_retry.as_str()));

    // Chain is exhausted.
    let err = manager.retry(&second_retry).await.expect_err("max reached");
    assert!(matches!(err, QueueError::IllegalTransition { .. }));

    wait_until("three error callbacks", || listener.error_count() == 3).await;

    manager.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_queue_cancels_pending_runs() {
    let manager = QueueManager::new(
        QueueConfig {
            max_concurrent_global: 1,
            ..test_config()
        },
        Arc::new(PendingExecutor),
        CollectListener::new(),
    );
    manager.start(false).await.expect("start");

    let blocker = manager
        .submit(SubmitRequest::new("blocker", "assistant"))
        .await
        .expect("submit");
    wait_until("blocker running", || manager.running_count() == 1).await;

    for n in 0..3 {
        manager
            .submit(SubmitRequest::new(format!("queued-{n}"), "assistant"))
            .await
            .expect("submit");
    }
    assert_eq!(manager.queued_count(), 3);

    assert_eq!(manager.clear_queue().await, 3);
    assert_eq!(manager.queued_count(), 0);
    assert_eq!(
        manager.get_run(&blocker).expect("blocker").state,
        RunState::Running
    );

    manager.stop(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_suspends_streaming_until_resume() {
    let listener = CollectListener::new();
    let manager = QueueManager::new(
        test_config(),
        Arc::new(ScriptedExecutor::with_delay(
            &["a", "b", "c", "d", "e"],
            Duration::from_millis(100),
        )),
        listener.clone(),
    );
    manager.start(false).await.expect("start");

    let run_id = manager
        .submit(SubmitRequest::new("x", "assistant"))
        .await
        .expect("submit");
    wait_until("first chunk", || !listener.outputs.lock().unwrap().is_empty()).await;

    assert!(manager.pause(&run_id).await);
    tokio::time::sleep(Duration::from_millis(250)).await;
    let paused_at = listener.outputs.lock().unwrap().len();
    // At most the chunk already in flight lands after the pause.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(listener.outputs.lock().unwrap().len() <= paused_at + 1);
    assert_eq!(
        manager.get_run(&run_id).expect("run").state,
        RunState::Paused
    );

    assert!(manager.resume(&run_id).await);
    let run = wait_terminal(&manager, &run_id).await;
    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.output_content.as_deref(), Some("abcde"));

    manager.stop(Duration::from_secs(2)).await;
}
