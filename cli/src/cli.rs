use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

/// runq CLI
#[derive(Debug, Parser)]
#[clap(
    name = "runq",
    version,
    about = "Priority-aware, persistent queue for streaming agent runs"
)]
pub struct Cli {
    /// Path to the queue store (defaults to .runq/queue.sqlite).
    #[clap(long = "store", value_name = "PATH", global = true)]
    pub store_path: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a single prompt through the queue and stream the result.
    Run(RunArgs),

    /// Inspect and manage queued runs.
    #[clap(subcommand)]
    Queue(QueueCommand),

    /// Inspect stored sessions.
    #[clap(subcommand)]
    Session(SessionCommand),
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Prompt to execute.
    pub prompt: String,

    /// Agent name routing the run to an executor configuration.
    #[clap(long, short)]
    pub agent: Option<String>,

    /// Model to use.
    #[clap(long, short)]
    pub model: Option<String>,

    /// Run priority (low, normal, high, urgent).
    #[clap(long, short, default_value = "normal")]
    pub priority: String,

    /// Session id to group this run under.
    #[clap(long)]
    pub session: Option<String>,

    /// Print the full output at the end instead of streaming chunks.
    #[clap(long)]
    pub no_stream: bool,
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// List runs.
    #[clap(visible_alias = "list")]
    Ls(LsArgs),

    /// Cancel a run by id or unique prefix.
    Cancel {
        /// Run id or unique prefix.
        run_id: String,
    },

    /// Retry a failed run by id or unique prefix.
    Retry {
        /// Run id or unique prefix.
        run_id: String,
    },

    /// Cancel every queued run.
    Clear {
        /// Skip the confirmation prompt.
        #[clap(long, short)]
        force: bool,
    },

    /// Show queue statistics.
    Stats {
        /// Restrict the statistics to one session.
        #[clap(long)]
        session: Option<String>,
    },
}

#[derive(Debug, Parser)]
pub struct LsArgs {
    /// Filter by state (queued, running, paused, succeeded, failed,
    /// cancelled).
    #[clap(long, short)]
    pub state: Option<String>,

    /// Filter by session id.
    #[clap(long)]
    pub session: Option<String>,

    /// Maximum number of results.
    #[clap(long, short = 'n', default_value_t = 20)]
    pub limit: usize,

    /// Output as JSON.
    #[clap(long, short)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// List recent sessions.
    #[clap(visible_alias = "list")]
    Ls {
        /// Maximum number of results.
        #[clap(long, short = 'n', default_value_t = 20)]
        limit: usize,
    },

    /// Show a stored session and its recent runs.
    Resume {
        /// Session id.
        session_id: String,
    },
}
