use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use runq_protocol::QueuedRun;
use runq_protocol::RunState;
use runq_protocol::StreamChunk;
use serde_json::Map;
use serde_json::Value;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::DropStrategy;
use crate::config::QueueConfig;
use crate::error::ExecutorError;
use crate::error::QueueError;
use crate::executor::AgentExecutor;
use crate::executor::ChunkStream;
use crate::executor::ExecutionRequest;
use crate::listener::QueueListener;
use crate::scheduler::QueueScheduler;
use crate::tools::ToolRegistry;

/// How often a worker re-checks a paused run.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded chunk buffer with an explicit overflow policy.
///
/// The sole backpressure surface of the system: neither strategy ever blocks
/// the producer. Consumers detect loss through the dropped counter and gaps
/// in chunk indices.
pub struct StreamBuffer {
    inner: Mutex<BufferState>,
    capacity: usize,
    strategy: DropStrategy,
}

#[derive(Default)]
struct BufferState {
    chunks: VecDeque<StreamChunk>,
    dropped: u64,
}

impl StreamBuffer {
    pub fn new(capacity: usize, strategy: DropStrategy) -> Self {
        Self {
            inner: Mutex::new(BufferState::default()),
            capacity,
            strategy,
        }
    }

    /// Returns `false` when the chunk was refused (`RejectNewest` overflow).
    pub fn push(&self, chunk: StreamChunk) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.chunks.len() >= self.capacity {
            match self.strategy {
                DropStrategy::DropOldest => {
                    inner.chunks.pop_front();
                    inner.dropped += 1;
                }
                DropStrategy::RejectNewest => {
                    inner.dropped += 1;
                    return false;
                }
            }
        }
        inner.chunks.push_back(chunk);
        true
    }

    /// Append the end-of-stream marker. Exempt from the drop policy so
    /// consumers always observe `is_final` even on an overflowing run.
    pub fn push_final(&self, chunk: StreamChunk) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.chunks.push_back(chunk);
    }

    /// Pop up to `max` chunks from the front.
    pub fn drain(&self, max: usize) -> Vec<StreamChunk> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let take = max.min(inner.chunks.len());
        inner.chunks.drain(..take).collect()
    }

    pub fn drain_all(&self) -> Vec<StreamChunk> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.chunks.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .chunks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total chunks discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dropped
    }
}

/// Shared context handed to every worker task.
struct WorkerContext {
    scheduler: Arc<QueueScheduler>,
    executor: Arc<dyn AgentExecutor>,
    listener: Arc<dyn QueueListener>,
    tools: ToolRegistry,
    buffers: Mutex<HashMap<String, Arc<StreamBuffer>>>,
    cancel: CancellationToken,
    poll_interval: Duration,
    stream_buffer_size: usize,
    drop_strategy: DropStrategy,
    run_timeout: Option<Duration>,
}

/// How one run execution ended, from the worker's point of view.
enum RunOutcome {
    Completed { output: String, chunks: u64 },
    Failed(QueueError),
    /// Cancellation token observed; the scheduler already transitioned the
    /// run, the worker just walks away.
    Abandoned,
    /// Pool shutdown interrupted the run mid-flight.
    Shutdown,
}

/// Pool of cooperative workers that poll the scheduler, drive executors and
/// pump streamed output through per-run bounded buffers.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        scheduler: Arc<QueueScheduler>,
        executor: Arc<dyn AgentExecutor>,
        listener: Arc<dyn QueueListener>,
        tools: ToolRegistry,
        config: &QueueConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                scheduler,
                executor,
                listener,
                tools,
                buffers: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                poll_interval: config.worker_poll_interval,
                stream_buffer_size: config.stream_buffer_size,
                drop_strategy: config.drop_strategy,
                run_timeout: config.run_timeout,
            }),
            workers: Mutex::new(Vec::new()),
            worker_count: config.max_concurrent_global,
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker_id in 0..self.worker_count {
            let ctx = Arc::clone(&self.ctx);
            workers.push(tokio::spawn(worker_loop(ctx, worker_id)));
        }
        debug!(count = self.worker_count, "started queue workers");
    }

    /// Stop the pool: workers finish their current run if they can within
    /// `deadline`; stragglers are aborted and their runs cancelled.
    pub async fn stop(&self, deadline: Duration) {
        self.ctx.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        if workers.is_empty() {
            self.started.store(false, Ordering::SeqCst);
            return;
        }
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let drained = tokio::time::timeout(deadline, futures::future::join_all(workers)).await;
        if drained.is_err() {
            warn!("workers did not drain before deadline, aborting");
            for abort in aborts {
                abort.abort();
            }
            // Whatever the aborted workers were holding becomes CANCELLED
            // through the normal path.
            for run in self.ctx.scheduler.running_runs() {
                self.ctx.scheduler.cancel(&run.run_id);
            }
        }
        self.started.store(false, Ordering::SeqCst);
        debug!("stopped queue workers");
    }

    /// The live buffer for a running run, if any. Buffers exist only while
    /// the owning worker executes the run.
    pub fn stream_buffer(&self, run_id: &str) -> Option<Arc<StreamBuffer>> {
        self.ctx
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    /// Number of runs currently being executed by workers.
    pub fn active_count(&self) -> usize {
        self.ctx
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.ctx.cancel.is_cancelled()
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>, worker_id: usize) {
    debug!(worker_id, "worker started");
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let Some(run) = ctx.scheduler.next() else {
            select! {
                _ = ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep(ctx.poll_interval) => {}
            }
            continue;
        };
        execute_run(&ctx, run).await;
    }
    debug!(worker_id, "worker stopped");
}

async fn execute_run(ctx: &Arc<WorkerContext>, run: QueuedRun) {
    let run_id = run.run_id.clone();
    let buffer = Arc::new(StreamBuffer::new(
        ctx.stream_buffer_size,
        ctx.drop_strategy,
    ));
    ctx.buffers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(run_id.clone(), Arc::clone(&buffer));

    let outcome = drive_run(ctx, &run, &buffer).await;

    match outcome {
        RunOutcome::Completed { output, chunks } => {
            let mut metrics = Map::new();
            metrics.insert("chunks".to_string(), Value::from(chunks));
            metrics.insert("output_length".to_string(), Value::from(output.len() as u64));
            if let Some(completed) = ctx.scheduler.complete(&run_id, Some(output), metrics) {
                ctx.listener.on_complete(&run_id, &completed).await;
            }
        }
        RunOutcome::Failed(error) => {
            if ctx
                .scheduler
                .fail(&run_id, &error.to_string(), Map::new())
                .is_some()
            {
                ctx.listener.on_error(&run_id, &error).await;
            }
        }
        RunOutcome::Abandoned => {
            debug!(run_id = %run_id, "run abandoned after cancellation");
        }
        RunOutcome::Shutdown => {
            ctx.scheduler.cancel(&run_id);
        }
    }

    ctx.buffers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&run_id);
}

async fn drive_run(
    ctx: &Arc<WorkerContext>,
    run: &QueuedRun,
    buffer: &StreamBuffer,
) -> RunOutcome {
    let run_id = run.run_id.as_str();
    let request = ExecutionRequest {
        run_id: run.run_id.clone(),
        agent_name: run.agent_name.clone(),
        input: run.input_content.clone(),
        config: run.config.clone(),
        session_id: run.session_id.clone(),
        chat_history: run.chat_history.clone(),
        tools: ctx.tools.tools_for(run_id),
    };

    if ctx.scheduler.is_cancelled(run_id) {
        ctx.scheduler.clear_cancel_token(run_id);
        return RunOutcome::Abandoned;
    }

    let deadline = ctx.run_timeout.map(|timeout| Instant::now() + timeout);

    // Preferred shape first: lazy async stream, then the blocking iterator
    // adapted with a cooperative yield, then the single-shot call.
    let stream: Option<ChunkStream> = match ctx.executor.stream(&request).await {
        Ok(stream) => Some(stream),
        Err(ExecutorError::Unsupported) => match ctx.executor.stream_blocking(&request) {
            Ok(iter) => Some(Box::pin(futures::stream::iter(iter).then(|item| async {
                tokio::task::yield_now().await;
                item
            }))),
            Err(_) => None,
        },
        // A failure before any chunk falls through to the single-shot path.
        Err(_) => None,
    };

    match stream {
        Some(stream) => consume_stream(ctx, run_id, &request, stream, buffer, deadline).await,
        None => chat_fallback(ctx, run_id, &request, buffer, deadline).await,
    }
}

async fn consume_stream(
    ctx: &Arc<WorkerContext>,
    run_id: &str,
    request: &ExecutionRequest,
    mut stream: ChunkStream,
    buffer: &StreamBuffer,
    deadline: Option<Instant>,
) -> RunOutcome {
    let mut output = String::new();
    let mut index: u64 = 0;

    loop {
        if ctx.scheduler.is_cancelled(run_id) {
            ctx.scheduler.clear_cancel_token(run_id);
            return RunOutcome::Abandoned;
        }
        match wait_while_paused(ctx, run_id, deadline).await {
            PauseWait::Proceed => {}
            PauseWait::Abandon => return RunOutcome::Abandoned,
            PauseWait::Shutdown => return RunOutcome::Shutdown,
            PauseWait::TimedOut(timeout) => return RunOutcome::Failed(QueueError::Timeout(timeout)),
        }

        let item = select! {
            _ = ctx.cancel.cancelled() => return RunOutcome::Shutdown,
            item = next_chunk(&mut stream, deadline) => item,
        };
        match item {
            Err(()) => {
                let timeout = ctx.run_timeout.unwrap_or_default();
                return RunOutcome::Failed(QueueError::Timeout(timeout));
            }
            Ok(None) => break,
            Ok(Some(Ok(chunk))) => {
                output.push_str(&chunk);
                buffer.push(StreamChunk::new(run_id, chunk.clone(), index));
                index += 1;
                ctx.listener.on_output(run_id, &chunk).await;
            }
            Ok(Some(Err(error))) => {
                if index == 0 {
                    // Aborted before producing anything: one shot at the
                    // non-streaming path.
                    debug!(run_id, %error, "stream failed at start, falling back to chat");
                    return chat_fallback(ctx, run_id, request, buffer, deadline).await;
                }
                return RunOutcome::Failed(QueueError::Executor(error));
            }
        }
    }

    buffer.push_final(StreamChunk::final_marker(run_id, index));
    RunOutcome::Completed {
        output,
        chunks: index,
    }
}

async fn chat_fallback(
    ctx: &Arc<WorkerContext>,
    run_id: &str,
    request: &ExecutionRequest,
    buffer: &StreamBuffer,
    deadline: Option<Instant>,
) -> RunOutcome {
    let result = match deadline {
        None => ctx.executor.chat(request).await,
        Some(deadline) => match tokio::time::timeout_at(deadline, ctx.executor.chat(request)).await
        {
            Ok(result) => result,
            Err(_) => {
                let timeout = ctx.run_timeout.unwrap_or_default();
                return RunOutcome::Failed(QueueError::Timeout(timeout));
            }
        },
    };
    match result {
        Ok(output) => {
            if ctx.scheduler.is_cancelled(run_id) {
                ctx.scheduler.clear_cancel_token(run_id);
                return RunOutcome::Abandoned;
            }
            // The single-shot path is legitimately non-streaming: the whole
            // output is one synthetic chunk.
            buffer.push(StreamChunk::new(run_id, output.clone(), 0));
            ctx.listener.on_output(run_id, &output).await;
            buffer.push_final(StreamChunk::final_marker(run_id, 1));
            RunOutcome::Completed { output, chunks: 1 }
        }
        Err(error) => RunOutcome::Failed(QueueError::Executor(error)),
    }
}

enum PauseWait {
    Proceed,
    Abandon,
    Shutdown,
    TimedOut(Duration),
}

async fn wait_while_paused(
    ctx: &Arc<WorkerContext>,
    run_id: &str,
    deadline: Option<Instant>,
) -> PauseWait {
    while ctx.scheduler.state_of(run_id) == Some(RunState::Paused) {
        if ctx.scheduler.is_cancelled(run_id) {
            ctx.scheduler.clear_cancel_token(run_id);
            return PauseWait::Abandon;
        }
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return PauseWait::TimedOut(ctx.run_timeout.unwrap_or_default());
        }
        select! {
            _ = ctx.cancel.cancelled() => return PauseWait::Shutdown,
            _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
        }
    }
    PauseWait::Proceed
}

/// `Err(())` means the run deadline expired while waiting for the chunk.
async fn next_chunk(
    stream: &mut ChunkStream,
    deadline: Option<Instant>,
) -> Result<Option<Result<String, ExecutorError>>, ()> {
    match deadline {
        None => Ok(stream.next().await),
        Some(deadline) => tokio::time::timeout_at(deadline, stream.next())
            .await
            .map_err(|_| ()),
    }
}
