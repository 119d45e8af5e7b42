//! `runq run` — one-shot execution: submit, stream to stdout, await the
//! terminal state, exit 0 on success and 1 on failure.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runq_core::QueueConfig;
use runq_core::QueueError;
use runq_core::QueueListener;
use runq_core::QueueManager;
use runq_core::SubmitRequest;
use runq_protocol::RunPriority;
use runq_protocol::RunState;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;

use crate::cli::RunArgs;
use crate::mock_provider::MockExecutor;

const TERMINAL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Streams chunks to stdout as they arrive; failures go to stderr.
struct StdoutListener {
    stream: bool,
}

#[async_trait]
impl QueueListener for StdoutListener {
    async fn on_output(&self, _run_id: &str, chunk: &str) {
        if self.stream {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        }
    }

    async fn on_error(&self, _run_id: &str, error: &QueueError) {
        eprintln!("Error: {error}");
    }
}

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let Some(priority) = RunPriority::parse(&args.priority.to_lowercase()) else {
        eprintln!("Invalid priority: {}", args.priority);
        return Ok(1);
    };

    let agent_name = args.agent.unwrap_or_else(|| "assistant".to_string());
    let mut agent_config = Map::new();
    agent_config.insert("name".to_string(), Value::from(agent_name.clone()));
    if let Some(model) = &args.model {
        agent_config.insert("model".to_string(), Value::from(model.clone()));
    }
    let mut config = Map::new();
    config.insert("agent_config".to_string(), Value::Object(agent_config));

    // One-shot runs use an ephemeral in-process queue: no persistence, no
    // recovery, torn down on exit.
    let manager = QueueManager::new(
        QueueConfig {
            enable_persistence: false,
            autosave_interval: Duration::ZERO,
            ..QueueConfig::default()
        },
        Arc::new(MockExecutor::default()),
        Arc::new(StdoutListener {
            stream: !args.no_stream,
        }),
    );
    manager.start(false).await?;

    let run_id = manager
        .submit(SubmitRequest {
            priority: Some(priority),
            session_id: args.session,
            config,
            ..SubmitRequest::new(args.prompt, agent_name)
        })
        .await?;
    debug!(run_id = %run_id, "submitted one-shot run");

    let run = loop {
        match manager.get_run(&run_id) {
            Some(run) if run.state.is_terminal() => break run,
            _ => tokio::time::sleep(TERMINAL_POLL_INTERVAL).await,
        }
    };

    let code = match run.state {
        RunState::Succeeded => {
            if args.no_stream {
                println!("{}", run.output_content.as_deref().unwrap_or_default());
            } else {
                println!();
            }
            0
        }
        _ => 1,
    };

    manager.stop(STOP_DEADLINE).await;
    Ok(code)
}
