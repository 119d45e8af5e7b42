//! `runq queue …` — store-backed queue management.
//!
//! These commands operate on the durable store directly so they work whether
//! or not a manager process is around; a live manager converges through its
//! own store reads and autosave.

use std::io::Write;
use std::path::Path;

use owo_colors::OwoColorize;
use runq_protocol::QueuedRun;
use runq_protocol::RunState;
use runq_state::QueueStore;
use runq_state::RunFilter;
use supports_color::Stream;

use crate::cli::LsArgs;
use crate::cli::QueueCommand;

const PREFIX_SEARCH_LIMIT: usize = 1000;

pub async fn run(command: QueueCommand, store_path: &Path) -> anyhow::Result<i32> {
    let store = QueueStore::open(store_path).await?;
    let code = match command {
        QueueCommand::Ls(args) => ls(&store, args).await?,
        QueueCommand::Cancel { run_id } => cancel(&store, &run_id).await?,
        QueueCommand::Retry { run_id } => retry(&store, &run_id).await?,
        QueueCommand::Clear { force } => clear(&store, force).await?,
        QueueCommand::Stats { session } => stats(&store, session.as_deref()).await?,
    };
    store.close().await;
    Ok(code)
}

async fn ls(store: &QueueStore, args: LsArgs) -> anyhow::Result<i32> {
    let state = match args.state.as_deref() {
        None => None,
        Some(raw) => match RunState::parse(&raw.to_lowercase()) {
            Some(state) => Some(state),
            None => {
                eprintln!("Invalid state: {raw}");
                return Ok(1);
            }
        },
    };

    let filter = RunFilter {
        state,
        session_id: args.session,
        limit: Some(args.limit),
        ..RunFilter::default()
    };
    let runs = store.list_runs(&filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(0);
    }

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(0);
    }

    println!(
        "{:<10} {:<12} {:<32} {:<10} {:<8} {:>8} {:>10}",
        "ID", "AGENT", "INPUT", "STATE", "PRIORITY", "WAIT", "DURATION"
    );
    for run in &runs {
        let wait = format!("{:.1}s", run.wait_time().num_milliseconds() as f64 / 1000.0);
        let duration = run
            .duration()
            .map(|duration| format!("{:.1}s", duration.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<12} {:<32} {:<10} {:<8} {:>8} {:>10}",
            run.run_id,
            run.agent_name,
            input_preview(&run.input_content),
            colored_state(run.state),
            run.priority.as_str(),
            wait,
            duration,
        );
    }
    Ok(0)
}

fn input_preview(input: &str) -> String {
    if input.chars().count() > 30 {
        let truncated: String = input.chars().take(27).collect();
        format!("{truncated}...")
    } else {
        input.to_string()
    }
}

fn colored_state(state: RunState) -> String {
    if supports_color::on_cached(Stream::Stdout).is_none() {
        return state.to_string();
    }
    match state {
        RunState::Queued | RunState::Paused => state.yellow().to_string(),
        RunState::Running => state.green().to_string(),
        RunState::Succeeded => state.cyan().to_string(),
        RunState::Failed => state.red().to_string(),
        RunState::Cancelled => state.dimmed().to_string(),
    }
}

/// Resolve an exact id or a unique prefix against the stored runs.
enum Resolved {
    One(QueuedRun),
    Ambiguous(Vec<String>),
    Missing,
}

async fn resolve_run(store: &QueueStore, id_or_prefix: &str) -> anyhow::Result<Resolved> {
    if let Some(run) = store.load_run(id_or_prefix).await? {
        return Ok(Resolved::One(run));
    }
    let runs = store
        .list_runs(&RunFilter {
            limit: Some(PREFIX_SEARCH_LIMIT),
            ..RunFilter::default()
        })
        .await?;
    Ok(match_prefix(runs, id_or_prefix))
}

fn match_prefix(runs: Vec<QueuedRun>, prefix: &str) -> Resolved {
    let mut matches: Vec<QueuedRun> = runs
        .into_iter()
        .filter(|run| run.run_id.starts_with(prefix))
        .collect();
    match matches.len() {
        0 => Resolved::Missing,
        1 => Resolved::One(matches.remove(0)),
        _ => Resolved::Ambiguous(matches.into_iter().map(|run| run.run_id).collect()),
    }
}

async fn cancel(store: &QueueStore, id_or_prefix: &str) -> anyhow::Result<i32> {
    let run = match resolve_run(store, id_or_prefix).await? {
        Resolved::One(run) => run,
        Resolved::Ambiguous(ids) => {
            eprintln!("Multiple matches for '{id_or_prefix}':");
            for id in ids {
                eprintln!("  {id}");
            }
            return Ok(1);
        }
        Resolved::Missing => {
            eprintln!("Run not found: {id_or_prefix}");
            return Ok(1);
        }
    };

    if run.state.is_terminal() {
        eprintln!("Run {} is already {}", run.run_id, run.state);
        return Ok(1);
    }

    store
        .update_run_state(&run.run_id, RunState::Cancelled, None, None)
        .await?;
    println!("Cancelled run: {}", run.run_id);
    Ok(0)
}

async fn retry(store: &QueueStore, id_or_prefix: &str) -> anyhow::Result<i32> {
    let run = match resolve_run(store, id_or_prefix).await? {
        Resolved::One(run) => run,
        Resolved::Ambiguous(ids) => {
            eprintln!("Multiple matches for '{id_or_prefix}':");
            for id in ids {
                eprintln!("  {id}");
            }
            return Ok(1);
        }
        Resolved::Missing => {
            eprintln!("Run not found: {id_or_prefix}");
            return Ok(1);
        }
    };

    if run.state != RunState::Failed {
        eprintln!("Can only retry failed runs (current: {})", run.state);
        return Ok(1);
    }
    if run.retry_count >= run.max_retries {
        eprintln!(
            "Max retries reached ({}/{})",
            run.retry_count, run.max_retries
        );
        return Ok(1);
    }

    let mut child = QueuedRun::new(run.agent_name.clone(), run.input_content.clone());
    child.priority = run.priority;
    child.session_id = run.session_id.clone();
    child.trace_id = run.trace_id.clone();
    child.workspace = run.workspace.clone();
    child.user_id = run.user_id.clone();
    child.retry_count = run.retry_count + 1;
    child.max_retries = run.max_retries;
    child.parent_run_id = Some(run.run_id.clone());
    child.config = run.config.clone();

    store.save_run(&child).await?;
    println!("Created retry run: {} (from {})", child.run_id, run.run_id);
    Ok(0)
}

async fn clear(store: &QueueStore, force: bool) -> anyhow::Result<i32> {
    if !force && !confirm("Clear all queued runs? [y/N] ")? {
        println!("Aborted.");
        return Ok(0);
    }

    let queued = store
        .list_runs(&RunFilter {
            state: Some(RunState::Queued),
            limit: Some(PREFIX_SEARCH_LIMIT),
            ..RunFilter::default()
        })
        .await?;
    let mut count = 0usize;
    for run in &queued {
        if store
            .update_run_state(&run.run_id, RunState::Cancelled, None, None)
            .await?
        {
            count += 1;
        }
    }
    println!("Cleared {count} queued runs");
    Ok(0)
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

async fn stats(store: &QueueStore, session: Option<&str>) -> anyhow::Result<i32> {
    let stats = store.stats(session).await?;
    println!("Queue statistics");
    println!();
    println!("  Queued:       {}", stats.queued_count);
    println!("  Running:      {}", stats.running_count);
    println!("  Succeeded:    {}", stats.succeeded_count);
    println!("  Failed:       {}", stats.failed_count);
    println!("  Cancelled:    {}", stats.cancelled_count);
    println!();
    println!("  Total runs:   {}", stats.total_runs);
    println!("  Avg wait:     {:.1}s", stats.avg_wait_seconds);
    println!("  Avg duration: {:.1}s", stats.avg_duration_seconds);
    Ok(0)
}
