use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use runq_protocol::ChatMessage;
use runq_protocol::QueueEvent;
use runq_protocol::QueueStats;
use runq_protocol::QueuedRun;
use runq_protocol::RunPriority;
use runq_protocol::RunState;
use runq_state::QueueStore;
use runq_state::RunFilter;
use runq_state::SessionRecord;
use serde_json::Map;
use serde_json::Value;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::error::Result;
use crate::executor::AgentExecutor;
use crate::listener::QueueListener;
use crate::scheduler::QueueScheduler;
use crate::tools::ExecutorTool;
use crate::tools::ToolRegistry;
use crate::worker::StreamBuffer;
use crate::worker::WorkerPool;

/// Parameters for [`QueueManager::submit`]. Optional fields fall back to the
/// manager's configuration and session context.
#[derive(Clone, Default)]
pub struct SubmitRequest {
    pub input: String,
    pub agent_name: String,
    pub priority: Option<RunPriority>,
    pub session_id: Option<String>,
    pub workspace: Option<String>,
    pub user_id: Option<String>,
    pub config: Map<String, Value>,
    pub chat_history: Vec<ChatMessage>,
    /// Explicit run id; minted when absent.
    pub run_id: Option<String>,
}

impl SubmitRequest {
    pub fn new(input: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            agent_name: agent_name.into(),
            ..Self::default()
        }
    }
}

type StoreSlot = Arc<Mutex<Option<QueueStore>>>;

/// Composite listener that writes terminal records to the store before the
/// user callback runs, and releases the run's tool registration.
struct PersistingListener {
    store: StoreSlot,
    scheduler: Arc<QueueScheduler>,
    tools: ToolRegistry,
    inner: Arc<dyn QueueListener>,
}

impl PersistingListener {
    fn store(&self) -> Option<QueueStore> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl QueueListener for PersistingListener {
    async fn on_output(&self, run_id: &str, chunk: &str) {
        self.inner.on_output(run_id, chunk).await;
    }

    async fn on_complete(&self, run_id: &str, run: &QueuedRun) {
        if let Some(store) = self.store()
            && let Err(err) = store.save_run(run).await
        {
            error!(run_id, "failed to persist completed run: {err:#}");
        }
        self.tools.unregister(run_id);
        self.inner.on_complete(run_id, run).await;
    }

    async fn on_error(&self, run_id: &str, queue_error: &QueueError) {
        if let Some(store) = self.store()
            && let Some(run) = self.scheduler.get_run(run_id)
            && let Err(err) = store.save_run(&run).await
        {
            error!(run_id, "failed to persist failed run: {err:#}");
        }
        self.tools.unregister(run_id);
        self.inner.on_error(run_id, queue_error).await;
    }

    fn on_event(&self, event: &QueueEvent) {
        self.inner.on_event(event);
    }
}

struct ManagerInner {
    running: bool,
    workers: Option<Arc<WorkerPool>>,
    autosave: Option<(CancellationToken, JoinHandle<()>)>,
    current_session: Option<String>,
}

/// Composition root: owns the scheduler, the worker pool and the store, and
/// exposes the single façade submitters (CLI, TUI, library users) bind to.
pub struct QueueManager {
    config: QueueConfig,
    scheduler: Arc<QueueScheduler>,
    executor: Arc<dyn AgentExecutor>,
    wrapped_listener: Arc<PersistingListener>,
    tools: ToolRegistry,
    store: StoreSlot,
    inner: Mutex<ManagerInner>,
}

impl QueueManager {
    pub fn new(
        config: QueueConfig,
        executor: Arc<dyn AgentExecutor>,
        listener: Arc<dyn QueueListener>,
    ) -> Self {
        let scheduler = Arc::new(QueueScheduler::new(config.clone()));
        let tools = ToolRegistry::new();
        let store: StoreSlot = Arc::new(Mutex::new(None));
        let wrapped_listener = Arc::new(PersistingListener {
            store: Arc::clone(&store),
            scheduler: Arc::clone(&scheduler),
            tools: tools.clone(),
            inner: listener,
        });
        scheduler.add_listener(wrapped_listener.clone());
        Self {
            config,
            scheduler,
            executor,
            wrapped_listener,
            tools,
            store,
            inner: Mutex::new(ManagerInner {
                running: false,
                workers: None,
                autosave: None,
                current_session: None,
            }),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self) -> Option<QueueStore> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the manager: open the store, recover pending runs, spawn the
    /// worker pool and the autosave task. Idempotent.
    pub async fn start(&self, recover: bool) -> Result<()> {
        {
            let mut inner = self.lock_inner();
            if inner.running {
                return Ok(());
            }
            inner.running = true;
        }
        let result = self.start_inner(recover).await;
        if result.is_err() {
            self.lock_inner().running = false;
        }
        result
    }

    async fn start_inner(&self, recover: bool) -> Result<()> {
        info!("starting queue manager");

        let store = if self.config.enable_persistence {
            let store = QueueStore::open(&self.config.store_path)
                .await
                .map_err(QueueError::store)?;
            Some(store)
        } else {
            None
        };
        *self.store.lock().unwrap_or_else(PoisonError::into_inner) = store.clone();

        if recover && let Some(store) = store.as_ref() {
            self.recover(store).await?;
        }

        let workers = Arc::new(WorkerPool::new(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.executor),
            self.wrapped_listener.clone(),
            self.tools.clone(),
            &self.config,
        ));
        workers.start();

        let autosave = match store {
            Some(store) if !self.config.autosave_interval.is_zero() => {
                let token = CancellationToken::new();
                let handle = tokio::spawn(autosave_loop(
                    Arc::clone(&self.scheduler),
                    store,
                    self.config.autosave_interval,
                    token.clone(),
                ));
                Some((token, handle))
            }
            _ => None,
        };

        let mut inner = self.lock_inner();
        inner.workers = Some(workers);
        inner.autosave = autosave;
        info!("queue manager started");
        Ok(())
    }

    async fn recover(&self, store: &QueueStore) -> Result<()> {
        let interrupted = store
            .mark_interrupted_as_failed()
            .await
            .map_err(QueueError::store)?;
        if interrupted > 0 {
            warn!(count = interrupted, "marked interrupted runs as failed");
        }
        let pending = store.load_pending().await.map_err(QueueError::store)?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "recovering pending runs");
        let run_ids: Vec<String> = pending.iter().map(|run| run.run_id.clone()).collect();
        self.scheduler.load_runs(pending);
        for run_id in &run_ids {
            store
                .mark_recovered(run_id)
                .await
                .map_err(QueueError::store)?;
        }
        Ok(())
    }

    /// Stop the manager: cancel autosave, drain the pool within `deadline`,
    /// flush every known run, close the store.
    pub async fn stop(&self, deadline: Duration) {
        let (workers, autosave) = {
            let mut inner = self.lock_inner();
            if !inner.running {
                return;
            }
            inner.running = false;
            (inner.workers.take(), inner.autosave.take())
        };
        info!("stopping queue manager");

        if let Some((token, handle)) = autosave {
            token.cancel();
            if let Err(err) = handle.await {
                warn!("autosave task ended abnormally: {err}");
            }
        }

        if let Some(workers) = workers {
            workers.stop(deadline).await;
        }

        if let Some(store) = self.store() {
            for run in self.scheduler.all_runs() {
                if let Err(err) = store.save_run(&run).await {
                    error!(run_id = %run.run_id, "failed to flush run on shutdown: {err:#}");
                }
            }
            store.close().await;
        }
        *self.store.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!("queue manager stopped");
    }

    /// Submit a new run. Returns its id after the first durable write.
    pub async fn submit(&self, request: SubmitRequest) -> Result<String> {
        let mut run = QueuedRun::new(request.agent_name, request.input);
        if let Some(run_id) = request.run_id {
            run.run_id = run_id;
        }
        run.priority = request.priority.unwrap_or(self.config.default_priority);
        run.session_id = request
            .session_id
            .or_else(|| self.lock_inner().current_session.clone());
        run.workspace = request.workspace.or_else(|| {
            std::env::current_dir()
                .ok()
                .map(|cwd| cwd.to_string_lossy().into_owned())
        });
        run.user_id = request.user_id;
        run.config = request.config;
        run.chat_history = request.chat_history;
        run.max_retries = self.config.default_max_retries;

        let run_id = self.scheduler.submit(run)?;
        self.persist(&run_id).await;
        Ok(run_id)
    }

    /// Cancel a queued or running run. Returns `false` for unknown or
    /// already-terminal ids.
    pub async fn cancel(&self, run_id: &str) -> bool {
        if !self.scheduler.cancel(run_id) {
            return false;
        }
        self.tools.unregister(run_id);
        self.persist(run_id).await;
        true
    }

    /// Retry a failed run; returns the id of the lineage child.
    pub async fn retry(&self, run_id: &str) -> Result<String> {
        let new_id = self.scheduler.retry(run_id)?;
        self.persist(&new_id).await;
        Ok(new_id)
    }

    pub async fn pause(&self, run_id: &str) -> bool {
        if !self.scheduler.pause(run_id) {
            return false;
        }
        self.persist(run_id).await;
        true
    }

    pub async fn resume(&self, run_id: &str) -> bool {
        if !self.scheduler.resume(run_id) {
            return false;
        }
        self.persist(run_id).await;
        true
    }

    /// Replace the input of a queued run.
    pub async fn update_input(&self, run_id: &str, new_input: &str) -> Result<()> {
        self.scheduler.update_input(run_id, new_input)?;
        self.persist(run_id).await;
        Ok(())
    }

    /// Cancel every queued run. Returns how many were cancelled.
    pub async fn clear_queue(&self) -> usize {
        let cancelled = self.scheduler.clear_queue();
        for run_id in &cancelled {
            self.tools.unregister(run_id);
            self.persist(run_id).await;
        }
        cancelled.len()
    }

    pub fn get_run(&self, run_id: &str) -> Option<QueuedRun> {
        self.scheduler.get_run(run_id)
    }

    pub fn queued_runs(&self) -> Vec<QueuedRun> {
        self.scheduler.queued_runs()
    }

    pub fn running_runs(&self) -> Vec<QueuedRun> {
        self.scheduler.running_runs()
    }

    /// List runs. Terminal-state queries hit the store (full history) when
    /// persistence is enabled; everything else is answered from the live
    /// scheduler.
    pub async fn list_runs(
        &self,
        state: Option<RunState>,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QueuedRun>> {
        if let Some(state) = state
            && state.is_terminal()
            && let Some(store) = self.store()
        {
            let filter = RunFilter {
                state: Some(state),
                session_id: session_id.map(str::to_string),
                limit: Some(limit),
                ..RunFilter::default()
            };
            return store.list_runs(&filter).await.map_err(QueueError::store);
        }

        let mut runs: Vec<QueuedRun> = self
            .scheduler
            .all_runs()
            .into_iter()
            .filter(|run| state.is_none_or(|state| run.state == state))
            .filter(|run| {
                session_id.is_none_or(|session| run.session_id.as_deref() == Some(session))
            })
            .collect();
        runs.truncate(limit);
        Ok(runs)
    }

    /// Aggregate statistics: store-backed when persistence is enabled,
    /// otherwise live counts.
    pub async fn stats(&self) -> Result<QueueStats> {
        if let Some(store) = self.store() {
            let session = self.lock_inner().current_session.clone();
            return store
                .stats(session.as_deref())
                .await
                .map_err(QueueError::store);
        }
        Ok(QueueStats {
            queued_count: self.scheduler.queued_count() as u64,
            running_count: self.scheduler.running_count() as u64,
            ..QueueStats::default()
        })
    }

    // Session context

    pub fn set_session(&self, session_id: impl Into<String>) {
        self.lock_inner().current_session = Some(session_id.into());
    }

    pub fn current_session(&self) -> Option<String> {
        self.lock_inner().current_session.clone()
    }

    /// Persist an opaque state blob for the current session.
    pub async fn save_session_state(&self, state: &Value) -> Result<()> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        let Some(session_id) = self.current_session() else {
            return Ok(());
        };
        store
            .save_session(&session_id, None, Some(state), None)
            .await
            .map_err(QueueError::store)
    }

    pub async fn load_session_state(&self, session_id: &str) -> Result<Option<Value>> {
        let Some(store) = self.store() else {
            return Ok(None);
        };
        let record = store
            .load_session(session_id)
            .await
            .map_err(QueueError::store)?;
        Ok(record.and_then(|record| record.state))
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let Some(store) = self.store() else {
            return Ok(Vec::new());
        };
        store.list_sessions(limit).await.map_err(QueueError::store)
    }

    // Tool registry

    /// Register run-specific tools. Must happen before submit; the
    /// registration is dropped when the run reaches a terminal state.
    pub fn register_tools(&self, run_id: &str, tools: Vec<Arc<dyn ExecutorTool>>) {
        self.tools.register(run_id, tools);
    }

    pub fn register_default_tools(&self, tools: Vec<Arc<dyn ExecutorTool>>) {
        self.tools.register_default(tools);
    }

    /// The live stream buffer for a running run, if any.
    pub fn stream_buffer(&self, run_id: &str) -> Option<Arc<StreamBuffer>> {
        let inner = self.lock_inner();
        inner
            .workers
            .as_ref()
            .and_then(|workers| workers.stream_buffer(run_id))
    }

    pub fn is_running(&self) -> bool {
        self.lock_inner().running
    }

    pub fn queued_count(&self) -> usize {
        self.scheduler.queued_count()
    }

    pub fn running_count(&self) -> usize {
        self.scheduler.running_count()
    }

    /// Best-effort write of the current snapshot; store failures are logged
    /// and never roll back in-memory state.
    async fn persist(&self, run_id: &str) {
        let Some(store) = self.store() else {
            return;
        };
        let Some(run) = self.scheduler.get_run(run_id) else {
            return;
        };
        if let Err(err) = store.save_run(&run).await {
            error!(run_id, "failed to persist run: {err:#}");
        }
    }
}

/// Periodic flush of every active (queued, running or paused) run.
async fn autosave_loop(
    scheduler: Arc<QueueScheduler>,
    store: QueueStore,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        for run in scheduler.all_runs() {
            if run.state.is_terminal() {
                continue;
            }
            if let Err(err) = store.save_run(&run).await {
                error!(run_id = %run.run_id, "autosave failed: {err:#}");
            }
        }
    }
}
