use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;

use chrono::Utc;
use runq_protocol::QueueEvent;
use runq_protocol::QueueEventMsg;
use runq_protocol::QueuedRun;
use runq_protocol::RunPriority;
use runq_protocol::RunState;
use runq_protocol::new_run_id;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::error::Result;
use crate::listener::QueueListener;

/// Priority-FIFO scheduler with admission control.
///
/// Four FIFO queues (one per priority), a running set, and a global id
/// index, all behind one mutex. The lock is held only for selection and set
/// mutation; events collected under the lock are delivered to listeners
/// after it is released, so listener code can never stall dispatch.
pub struct QueueScheduler {
    config: QueueConfig,
    state: Mutex<SchedulerState>,
    listeners: RwLock<Vec<Arc<dyn QueueListener>>>,
}

#[derive(Default)]
struct SchedulerState {
    /// Queued run ids, one FIFO per priority level, indexed by
    /// `RunPriority::as_i64`.
    queues: [VecDeque<String>; 4],
    /// Ids currently held by a worker. Paused runs stay in this set.
    running: HashSet<String>,
    /// Every run this scheduler has ever seen, including terminal ones.
    runs: HashMap<String, QueuedRun>,
    /// Ids whose workers must abandon at the next suspension point.
    cancel_tokens: HashSet<String>,
}

fn queue_index(priority: RunPriority) -> usize {
    priority.as_i64() as usize
}

impl SchedulerState {
    fn queued_total(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Per-agent and per-workspace admission. The global cap is checked by
    /// the caller before scanning.
    fn admits(&self, run_id: &str, config: &QueueConfig) -> bool {
        let Some(run) = self.runs.get(run_id) else {
            return false;
        };
        let agent_count = self
            .running
            .iter()
            .filter_map(|id| self.runs.get(id))
            .filter(|running| running.agent_name == run.agent_name)
            .count();
        if agent_count >= config.max_concurrent_per_agent {
            return false;
        }
        if let Some(workspace) = run.workspace.as_deref() {
            let workspace_count = self
                .running
                .iter()
                .filter_map(|id| self.runs.get(id))
                .filter(|running| running.workspace.as_deref() == Some(workspace))
                .count();
            if workspace_count >= config.max_concurrent_per_workspace {
                return false;
            }
        }
        true
    }
}

impl QueueScheduler {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SchedulerState::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn QueueListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<QueueEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for event in &events {
            for listener in &listeners {
                listener.on_event(event);
            }
        }
    }

    /// Admit a run into its priority queue. The run's state is forced to
    /// QUEUED regardless of what the caller set.
    pub fn submit(&self, mut run: QueuedRun) -> Result<String> {
        let event;
        {
            let mut state = self.lock_state();
            if state.runs.contains_key(&run.run_id) {
                return Err(QueueError::Duplicate(run.run_id));
            }
            let queued = state.queued_total();
            if queued >= self.config.max_queue_size {
                return Err(QueueError::QueueFull {
                    queued,
                    capacity: self.config.max_queue_size,
                });
            }
            run.state = RunState::Queued;
            event = QueueEvent::new(
                run.run_id.clone(),
                QueueEventMsg::RunSubmitted {
                    priority: run.priority,
                    agent: run.agent_name.clone(),
                },
            );
            debug!(run_id = %run.run_id, priority = %run.priority, "submitted run");
            let run_id = run.run_id.clone();
            state.queues[queue_index(run.priority)].push_back(run_id.clone());
            state.runs.insert(run_id, run);
        }
        let run_id = event.run_id.clone();
        self.emit(vec![event]);
        Ok(run_id)
    }

    /// Dispatch the next run, respecting priority order and all three
    /// concurrency caps. A head-of-line run blocked by a per-agent or
    /// per-workspace cap does not block later runs.
    pub fn next(&self) -> Option<QueuedRun> {
        let (snapshot, event) = {
            let mut state = self.lock_state();
            if state.running.len() >= self.config.max_concurrent_global {
                return None;
            }
            let mut selected = None;
            'scan: for priority in RunPriority::DESCENDING {
                let idx = queue_index(priority);
                for (pos, run_id) in state.queues[idx].iter().enumerate() {
                    if state.admits(run_id, &self.config) {
                        selected = Some((idx, pos));
                        break 'scan;
                    }
                }
            }
            let (idx, pos) = selected?;
            let run_id = state.queues[idx].remove(pos)?;
            state.running.insert(run_id.clone());
            let run = state.runs.get_mut(&run_id)?;
            run.state = RunState::Running;
            run.started_at = Some(Utc::now());
            debug!(run_id = %run_id, "starting run");
            let event = QueueEvent::new(
                run_id,
                QueueEventMsg::RunStarted {
                    agent: run.agent_name.clone(),
                },
            );
            (run.clone(), event)
        };
        self.emit(vec![event]);
        Some(snapshot)
    }

    /// Mark a running run as SUCCEEDED. Returns the updated snapshot, or
    /// `None` if the run is no longer in the running set (e.g. it was
    /// cancelled while the worker was finishing).
    pub fn complete(
        &self,
        run_id: &str,
        output: Option<String>,
        metrics: Map<String, Value>,
    ) -> Option<QueuedRun> {
        let (snapshot, event) = {
            let mut state = self.lock_state();
            if !state.running.remove(run_id) {
                warn!(run_id, "complete for run not in running set");
                return None;
            }
            let run = state.runs.get_mut(run_id)?;
            run.state = RunState::Succeeded;
            run.ended_at = Some(Utc::now());
            run.output_content = output;
            run.metrics.extend(metrics);
            let event = QueueEvent::new(
                run_id,
                QueueEventMsg::RunCompleted {
                    duration_seconds: run
                        .duration()
                        .map(|duration| duration.num_milliseconds() as f64 / 1000.0),
                },
            );
            (run.clone(), event)
        };
        debug!(run_id, "completed run");
        self.emit(vec![event]);
        Some(snapshot)
    }

    /// Mark a running run as FAILED. Same no-op semantics as
    /// [`QueueScheduler::complete`] for runs already out of the running set.
    pub fn fail(
        &self,
        run_id: &str,
        error: &str,
        metrics: Map<String, Value>,
    ) -> Option<QueuedRun> {
        let (snapshot, event) = {
            let mut state = self.lock_state();
            if !state.running.remove(run_id) {
                warn!(run_id, "fail for run not in running set");
                return None;
            }
            let run = state.runs.get_mut(run_id)?;
            run.state = RunState::Failed;
            run.ended_at = Some(Utc::now());
            run.error = Some(error.to_string());
            run.metrics.extend(metrics);
            let event = QueueEvent::new(
                run_id,
                QueueEventMsg::RunFailed {
                    error: error.to_string(),
                },
            );
            (run.clone(), event)
        };
        debug!(run_id, error, "failed run");
        self.emit(vec![event]);
        Some(snapshot)
    }

    /// Cancel a queued or running run. Idempotent: terminal and unknown ids
    /// return `false`. Cancelling a running run arms its cancellation token;
    /// the worker abandons at its next suspension point without calling
    /// complete or fail.
    pub fn cancel(&self, run_id: &str) -> bool {
        let event;
        {
            let mut state = self.lock_state();
            if state.running.remove(run_id) {
                state.cancel_tokens.insert(run_id.to_string());
                let Some(run) = state.runs.get_mut(run_id) else {
                    return false;
                };
                run.state = RunState::Cancelled;
                run.ended_at = Some(Utc::now());
                event = QueueEvent::new(run_id, QueueEventMsg::RunCancelled { was_running: true });
                debug!(run_id, "cancelled running run");
            } else {
                let mut found = false;
                for queue in state.queues.iter_mut() {
                    if let Some(pos) = queue.iter().position(|id| id == run_id) {
                        queue.remove(pos);
                        found = true;
                        break;
                    }
                }
                if !found {
                    return false;
                }
                let Some(run) = state.runs.get_mut(run_id) else {
                    return false;
                };
                run.state = RunState::Cancelled;
                run.ended_at = Some(Utc::now());
                event = QueueEvent::new(run_id, QueueEventMsg::RunCancelled { was_running: false });
                debug!(run_id, "cancelled queued run");
            }
        }
        self.emit(vec![event]);
        true
    }

    /// Whether a worker touching this id must abandon it.
    pub fn is_cancelled(&self, run_id: &str) -> bool {
        self.lock_state().cancel_tokens.contains(run_id)
    }

    pub fn clear_cancel_token(&self, run_id: &str) {
        self.lock_state().cancel_tokens.remove(run_id);
    }

    /// Pause a RUNNING run. Workers poll for this at every chunk boundary
    /// and idle-sleep while paused.
    pub fn pause(&self, run_id: &str) -> bool {
        let event;
        {
            let mut state = self.lock_state();
            if !state.running.contains(run_id) {
                return false;
            }
            let Some(run) = state.runs.get_mut(run_id) else {
                return false;
            };
            if run.state != RunState::Running {
                return false;
            }
            run.state = RunState::Paused;
            event = QueueEvent::new(run_id, QueueEventMsg::RunPaused);
        }
        self.emit(vec![event]);
        true
    }

    pub fn resume(&self, run_id: &str) -> bool {
        let event;
        {
            let mut state = self.lock_state();
            if !state.running.contains(run_id) {
                return false;
            }
            let Some(run) = state.runs.get_mut(run_id) else {
                return false;
            };
            if run.state != RunState::Paused {
                return false;
            }
            run.state = RunState::Running;
            event = QueueEvent::new(run_id, QueueEventMsg::RunResumed);
        }
        self.emit(vec![event]);
        true
    }

    /// Replace the input of a run that has not started yet.
    pub fn update_input(&self, run_id: &str, new_input: &str) -> Result<()> {
        let event;
        {
            let mut state = self.lock_state();
            let run = state
                .runs
                .get_mut(run_id)
                .ok_or_else(|| QueueError::NotFound(run_id.to_string()))?;
            if run.state != RunState::Queued {
                return Err(QueueError::IllegalTransition {
                    run_id: run_id.to_string(),
                    state: run.state,
                    operation: "edit",
                });
            }
            run.input_content = new_input.to_string();
            event = QueueEvent::new(run_id, QueueEventMsg::RunUpdated);
        }
        self.emit(vec![event]);
        Ok(())
    }

    /// Retry a failed run by submitting a fresh run linked to it. The child
    /// copies payload, routing, priority and config; chat history is not
    /// carried over. Returns the new run id.
    pub fn retry(&self, run_id: &str) -> Result<String> {
        let child = {
            let state = self.lock_state();
            let original = state
                .runs
                .get(run_id)
                .ok_or_else(|| QueueError::NotFound(run_id.to_string()))?;
            if !original.can_retry() {
                return Err(QueueError::IllegalTransition {
                    run_id: run_id.to_string(),
                    state: original.state,
                    operation: "retry",
                });
            }
            QueuedRun {
                run_id: new_run_id(),
                agent_name: original.agent_name.clone(),
                input_content: original.input_content.clone(),
                state: RunState::Queued,
                priority: original.priority,
                session_id: original.session_id.clone(),
                trace_id: original.trace_id.clone(),
                workspace: original.workspace.clone(),
                user_id: original.user_id.clone(),
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
                output_content: None,
                error: None,
                metrics: Map::new(),
                retry_count: original.retry_count + 1,
                max_retries: original.max_retries,
                parent_run_id: Some(original.run_id.clone()),
                config: original.config.clone(),
                chat_history: Vec::new(),
            }
        };

        // Submitted outside the lock through the normal admission path.
        let retry_count = child.retry_count;
        let new_id = self.submit(child)?;
        debug!(run_id, new_id = %new_id, "retrying run");
        self.emit(vec![QueueEvent::new(
            new_id.clone(),
            QueueEventMsg::RunRetried {
                parent_run_id: run_id.to_string(),
                retry_count,
            },
        )]);
        Ok(new_id)
    }

    /// Ingest runs from the store after a restart. Records persisted as
    /// RUNNING are forced back to QUEUED with their start time cleared.
    pub fn load_runs(&self, runs: Vec<QueuedRun>) {
        let mut state = self.lock_state();
        let count = runs.len();
        for mut run in runs {
            if run.state == RunState::Running {
                run.state = RunState::Queued;
                run.started_at = None;
            }
            if run.state == RunState::Queued {
                state.queues[queue_index(run.priority)].push_back(run.run_id.clone());
            }
            state.runs.insert(run.run_id.clone(), run);
        }
        drop(state);
        debug!(count, "loaded runs from store");
    }

    /// Cancel every queued run. Running runs are untouched. Returns the
    /// cancelled ids.
    pub fn clear_queue(&self) -> Vec<String> {
        let (cancelled, events) = {
            let mut state = self.lock_state();
            let mut cancelled = Vec::new();
            for idx in 0..state.queues.len() {
                while let Some(run_id) = state.queues[idx].pop_front() {
                    if let Some(run) = state.runs.get_mut(&run_id) {
                        run.state = RunState::Cancelled;
                        run.ended_at = Some(Utc::now());
                    }
                    cancelled.push(run_id);
                }
            }
            let events = cancelled
                .iter()
                .map(|run_id| {
                    QueueEvent::new(
                        run_id.clone(),
                        QueueEventMsg::RunCancelled { was_running: false },
                    )
                })
                .collect();
            (cancelled, events)
        };
        self.emit(events);
        cancelled
    }

    pub fn get_run(&self, run_id: &str) -> Option<QueuedRun> {
        self.lock_state().runs.get(run_id).cloned()
    }

    pub fn state_of(&self, run_id: &str) -> Option<RunState> {
        self.lock_state().runs.get(run_id).map(|run| run.state)
    }

    /// All queued runs in dispatch order (priority desc, FIFO within).
    pub fn queued_runs(&self) -> Vec<QueuedRun> {
        let state = self.lock_state();
        let mut result = Vec::with_capacity(state.queued_total());
        for priority in RunPriority::DESCENDING {
            for run_id in &state.queues[queue_index(priority)] {
                if let Some(run) = state.runs.get(run_id) {
                    result.push(run.clone());
                }
            }
        }
        result
    }

    pub fn running_runs(&self) -> Vec<QueuedRun> {
        let state = self.lock_state();
        state
            .running
            .iter()
            .filter_map(|run_id| state.runs.get(run_id))
            .cloned()
            .collect()
    }

    pub fn all_runs(&self) -> Vec<QueuedRun> {
        self.lock_state().runs.values().cloned().collect()
    }

    pub fn queued_count(&self) -> usize {
        self.lock_state().queued_total()
    }

    pub fn running_count(&self) -> usize {
        self.lock_state().running.len()
    }
}
