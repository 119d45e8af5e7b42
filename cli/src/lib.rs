//! The `runq` command line: queue inspection and management commands that
//! read the store directly, plus a one-shot `run` command that spins up an
//! ephemeral in-process queue manager.
//!
//! Stdout carries command output (tables, JSON, streamed chunks); logs and
//! errors go to stderr.

mod cli;
mod mock_provider;
mod queue_cmd;
mod run_cmd;
mod session_cmd;

pub use cli::Cli;
pub use cli::Command;
pub use cli::LsArgs;
pub use cli::QueueCommand;
pub use cli::RunArgs;
pub use cli::SessionCommand;
pub use mock_provider::MockExecutor;
pub use mock_provider::MockProvider;

use runq_core::QueueConfig;
use supports_color::Stream;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Run one CLI invocation; returns the process exit code.
pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    let default_level = "error";
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(supports_color::on_cached(Stream::Stderr).is_some())
        .with_writer(std::io::stderr)
        .with_filter(env_filter);
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();

    let store_path = cli
        .store_path
        .unwrap_or_else(|| QueueConfig::default().store_path);

    match cli.command {
        Command::Run(args) => run_cmd::run(args).await,
        Command::Queue(command) => queue_cmd::run(command, &store_path).await,
        Command::Session(command) => session_cmd::run(command, &store_path).await,
    }
}
