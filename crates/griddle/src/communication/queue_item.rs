use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use crate::error::TaskError;
use crate::task::{Task, TaskId, TaskResult};

/// # ResultSender
///
/// The producing half of a task's result channel, owned by the scheduler for
/// as long as the task is queued or bound to a slot.
///
/// It enforces the closing rule of a result stream: once a final result has
/// been sent, nothing else goes out. If the sender is dropped before a final
/// result was sent (the scheduler stopped, or a task was discarded) it emits a
/// final `ShuttingDown` error itself, so a waiting submitter never hangs.
/// Either way it records when the channel finished.
pub(crate) struct ResultSender {
    task_id: TaskId,
    sender: UnboundedSender<TaskResult>,
    cancel: CancellationToken,
    finished: Arc<OnceLock<Instant>>,
    closed: bool,
}

impl ResultSender {
    pub fn new(task_id: TaskId, sender: UnboundedSender<TaskResult>, cancel: CancellationToken) -> Self {
        Self {
            task_id,
            sender,
            cancel,
            finished: Arc::new(OnceLock::new()),
            closed: false,
        }
    }

    /// Shared marker holding the time the final result went out.
    pub fn finished(&self) -> Arc<OnceLock<Instant>> {
        self.finished.clone()
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// `true` once the submitter asked for the task to be cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send one result. Returns `false` if the channel is already closed or
    /// the receiving side is gone.
    pub fn send(&mut self, result: TaskResult) -> bool {
        if self.closed {
            warn!(task_id = self.task_id, "dropping result sent after the final one");
            return false;
        }
        self.closed = result.is_final;
        let sent = self.sender.send(result).is_ok();
        if self.closed {
            self.mark_finished();
        }
        sent
    }

    pub fn fail(&mut self, error: TaskError) -> bool {
        self.send(TaskResult::error(self.task_id, error))
    }

    fn mark_finished(&self) {
        let _ = self.finished.set(Instant::now());
    }
}

impl Drop for ResultSender {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.sender.send(TaskResult::error(self.task_id, TaskError::ShuttingDown));
            self.mark_finished();
        }
    }
}

/// # QueueItem
///
/// A task paired with the channel its results go to.
///
/// This is what travels through the [`TaskQueue`](super::TaskQueue) and what
/// a slot holds while it runs the task.
pub(crate) struct QueueItem {
    pub task: Task,
    pub reply: ResultSender,
}

impl QueueItem {
    pub fn new(task: Task, reply: ResultSender) -> Self {
        Self { task, reply }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }
}
