//! # Submission surface
//!
//! [`ServerHandle`] is what a transport layer holds: it validates and
//! enqueues tasks, hands out their results, and exposes read-only views of
//! the scheduler.

use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};
use crate::communication::{QueueItem, ResultRegistry, ResultStream, TaskQueue};
use crate::config::ServerConfig;
use crate::core::slot::SlotSnapshot;
use crate::core::{validate_filename, Metrics, Scheduler, ServerSnapshot, WorkerHandle};
use crate::engine::{Engine, SpecialTokens};
use crate::error::{Result, ServerError};
use crate::task::{Task, TaskId, TaskKind, TaskResult};

/// Coarse server state, as reported by a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthState {
    /// At least one slot is idle.
    Ready,
    /// Every slot is busy; new tasks will queue.
    NoSlotAvailable,
    /// A shutdown was requested and the scheduler is winding down.
    ShuttingDown,
    /// The scheduler is gone.
    Stopped,
}

struct Inner {
    config: ServerConfig,
    n_vocab: usize,
    special: SpecialTokens,
    queue: Arc<TaskQueue>,
    registry: Arc<ResultRegistry>,
    snapshot: watch::Receiver<ServerSnapshot>,
    worker: WorkerHandle,
}

/// # ServerHandle
///
/// A cheaply cloneable handle to one running scheduler and its engine.
///
/// ## Usage
///
/// ```ignore
/// let server = ServerHandle::spawn(engine, ServerConfig::default())?;
/// let id = server.submit(Task::generate(prompt, 64).streaming())?;
/// let mut results = server.stream(id)?;
/// while let Some(result) = results.next().await {
///     // forward result.payload
/// }
/// ```
///
/// All submission methods are safe to call from any task or thread. Only
/// [`await_result`](Self::await_result) suspends; everything else returns
/// immediately.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<Inner>,
}

impl ServerHandle {
    /// Validates `config` and starts the scheduler on the current Tokio runtime.
    ///
    /// # Parameters
    ///
    /// * `engine` - The inference backend. It is moved into the scheduler task.
    /// * `config` - Startup configuration, read once.
    ///
    /// # Returns
    ///
    /// A handle to the running server, or `ServerError::Config` if the
    /// configuration is unusable.
    pub fn spawn<E: Engine>(engine: E, config: ServerConfig) -> Result<Self> {
        let config = config.validated()?;
        if let Some(dir) = &config.slot_save_path {
            std::fs::create_dir_all(dir)
                .map_err(|e| ServerError::Config(format!("slot_save_path {}: {e}", dir.display())))?;
        }

        let n_vocab = engine.n_vocab();
        let special = engine.special_tokens();
        let notifier = Arc::new(Notify::new());
        let queue = Arc::new(TaskQueue::new(config.queue_capacity, notifier.clone()));
        let registry = Arc::new(ResultRegistry::new(config.result_retention));
        let (tx, snapshot) = watch::channel(ServerSnapshot::default());
        let scheduler = Scheduler::new(engine, config.clone(), queue.clone(), registry.clone(), tx);

        let worker = WorkerHandle::with_notifier(notifier, move |shutdown, notifier| {
            tokio::spawn(scheduler.run(shutdown, notifier))
        });
        info!(n_slots = config.n_slots, n_vocab, "server spawned");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                n_vocab,
                special,
                queue,
                registry,
                snapshot,
                worker,
            }),
        })
    }

    /// The effective configuration, after validation.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Validates and enqueues a task. Never blocks.
    ///
    /// # Returns
    ///
    /// The task's id. Fails with `Validation` for malformed tasks, with
    /// `QueueFull` when the bounded queue is saturated and with
    /// `ShuttingDown` once the scheduler stops accepting work.
    pub fn submit(&self, task: Task) -> Result<TaskId> {
        self.validate(&task)?;
        let kind = task.kind.name();
        let registry = &self.inner.registry;
        let id = self.inner.queue.submit(task, |task| {
            let reply = registry.open(task.id);
            QueueItem::new(task, reply)
        })?;
        debug!(task_id = id, kind, "task submitted");
        Ok(id)
    }

    /// Waits for the next result of a task.
    ///
    /// Returns a final `Cancelled` result straight away if the task was
    /// cancelled. A timeout leaves the task running; call again to keep
    /// waiting.
    pub async fn await_result(&self, task_id: TaskId, timeout: Duration) -> Result<TaskResult> {
        self.inner.registry.await_result(task_id, timeout).await
    }

    /// Takes the task's results as a stream that ends after the final one.
    pub fn stream(&self, task_id: TaskId) -> Result<ResultStream> {
        self.inner.registry.take_stream(task_id)
    }

    /// Requests cancellation. Idempotent.
    ///
    /// A queued task is dropped, a running one frees its slot at the next
    /// iteration boundary. Returns `false` if the task is unknown or already
    /// delivered its final result.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let found = self.inner.registry.cancel(task_id);
        self.inner.queue.notify();
        found
    }

    /// Copied per-slot state as of the last scheduler iteration.
    pub fn slots(&self) -> Vec<SlotSnapshot> {
        self.inner.snapshot.borrow().slots.clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.inner.snapshot.borrow().metrics.clone()
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// A receiver that is updated after every scheduler iteration.
    pub fn subscribe(&self) -> watch::Receiver<ServerSnapshot> {
        self.inner.snapshot.clone()
    }

    pub fn health(&self) -> HealthState {
        let worker = &self.inner.worker;
        if !worker.is_running() {
            return HealthState::Stopped;
        }
        if worker.is_stopping() || self.inner.queue.is_closed() {
            return HealthState::ShuttingDown;
        }
        if self.slots().iter().all(SlotSnapshot::is_processing) {
            HealthState::NoSlotAvailable
        } else {
            HealthState::Ready
        }
    }

    /// No slot is processing and no task is waiting.
    pub fn is_idle(&self) -> bool {
        self.inner.queue.is_empty() && !self.slots().iter().any(SlotSnapshot::is_processing)
    }

    /// Stops the scheduler.
    ///
    /// The first call lets the current iteration finish, then fails every
    /// outstanding task with `ShuttingDown`. A second call aborts the
    /// scheduler immediately. Returns `true` if this call forced the stop.
    pub fn shutdown(&self) -> bool {
        self.inner.worker.shutdown()
    }

    /// Waits until the scheduler task has exited.
    pub async fn join(&self) {
        self.inner.worker.join().await
    }

    fn validate(&self, task: &Task) -> Result<()> {
        let invalid = |msg: String| Err(ServerError::Validation(msg));
        match &task.kind {
            TaskKind::Cancel { .. } | TaskKind::EraseSlot { .. } => return Ok(()),
            TaskKind::SaveSlot { filename, .. } | TaskKind::RestoreSlot { filename, .. } => {
                return validate_filename(filename).or_else(|e| invalid(e.to_string()));
            }
            TaskKind::Infill { input_prefix, input_suffix } => {
                let special = &self.inner.special;
                if special.fim_prefix.is_none() || special.fim_suffix.is_none() || special.fim_middle.is_none() {
                    return invalid("model does not support infill".into());
                }
                input_prefix.validate(self.inner.n_vocab).or_else(invalid)?;
                input_suffix.validate(self.inner.n_vocab).or_else(invalid)?;
            }
            TaskKind::Generate | TaskKind::Embed | TaskKind::Rerank => {
                if task.prompt.is_empty() {
                    return invalid("prompt is empty".into());
                }
            }
        }

        task.prompt.validate(self.inner.n_vocab).or_else(invalid)?;

        let temperature = task.sampling.temperature;
        if !temperature.is_finite() || temperature < 0.0 {
            return invalid(format!("temperature must be a non-negative number, got {temperature}"));
        }
        if let Some(stop) = task.sampling.stop.iter().find(|s| s.iter().any(|t| *t as usize >= self.inner.n_vocab)) {
            return invalid(format!("stop sequence {stop:?} is out of vocabulary range"));
        }

        if !task.kind.generates() && task.prompt.len() > self.inner.config.n_batch {
            return invalid(format!(
                "input of {} positions is too large to process, increase n_batch (currently {})",
                task.prompt.len(),
                self.inner.config.n_batch
            ));
        }
        Ok(())
    }
}
