//! `runq session …` — store-backed session inspection.

use std::path::Path;

use chrono::DateTime;
use chrono::Local;
use chrono::Utc;
use runq_state::QueueStore;
use runq_state::RunFilter;

use crate::cli::SessionCommand;

const RESUME_RUN_LIMIT: usize = 10;

pub async fn run(command: SessionCommand, store_path: &Path) -> anyhow::Result<i32> {
    let store = QueueStore::open(store_path).await?;
    let code = match command {
        SessionCommand::Ls { limit } => ls(&store, limit).await?,
        SessionCommand::Resume { session_id } => resume(&store, &session_id).await?,
    };
    store.close().await;
    Ok(code)
}

fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

async fn ls(store: &QueueStore, limit: usize) -> anyhow::Result<i32> {
    let sessions = store.list_sessions(limit).await?;
    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(0);
    }

    println!(
        "{:<36} {:<12} {:<17} {:<17}",
        "ID", "USER", "CREATED", "UPDATED"
    );
    for session in &sessions {
        println!(
            "{:<36} {:<12} {:<17} {:<17}",
            session.session_id,
            session.user_id.as_deref().unwrap_or("-"),
            format_time(session.created_at),
            format_time(session.updated_at),
        );
    }
    Ok(0)
}

async fn resume(store: &QueueStore, session_id: &str) -> anyhow::Result<i32> {
    let Some(session) = store.load_session(session_id).await? else {
        eprintln!("Session not found: {session_id}");
        return Ok(1);
    };

    println!("Session {}", session.session_id);
    if let Some(user_id) = &session.user_id {
        println!("  User:    {user_id}");
    }
    println!("  Created: {}", format_time(session.created_at));
    println!("  Updated: {}", format_time(session.updated_at));
    if let Some(state) = &session.state {
        println!("  State:   {}", serde_json::to_string(state)?);
    }

    let runs = store
        .list_runs(&RunFilter {
            session_id: Some(session.session_id.clone()),
            limit: Some(RESUME_RUN_LIMIT),
            ..RunFilter::default()
        })
        .await?;
    if !runs.is_empty() {
        println!();
        println!("Recent runs:");
        for run in &runs {
            println!("  {:<10} {:<10} {}", run.run_id, run.state, run.agent_name);
        }
    }
    println!();
    println!("Continue this session with: runq run \"<prompt>\" --session {session_id}");
    Ok(0)
}
