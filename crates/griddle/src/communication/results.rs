use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use super::item_stream::ResultStream;
use super::queue_item::ResultSender;
use crate::error::ServerError;
use crate::task::{TaskId, TaskResult};

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskResult>>>;

/// One task's entry in the registry.
struct ResultChannel {
    /// `None` once the consumer took the channel as a stream.
    receiver: Option<SharedReceiver>,
    cancel: CancellationToken,
    /// Set by the producer when the final result went out.
    finished: Arc<OnceLock<Instant>>,
}

impl ResultChannel {
    fn finished_at(&self) -> Option<Instant> {
        self.finished.get().copied()
    }
}

/// # ResultRegistry
///
/// Maps task ids to their result channels.
///
/// A channel is opened when a task is admitted and removed once its final
/// result has been handed to the consumer, or when it is cancelled and the
/// consumer observes it. A channel taken as a stream leaves a cancel-only
/// entry behind until the task finishes. Results nobody collects are dropped
/// `retention` after the final one was produced.
pub(crate) struct ResultRegistry {
    channels: Mutex<HashMap<TaskId, ResultChannel>>,
    retention: Duration,
}

impl ResultRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Open the channel of a newly admitted task and return its producing half.
    pub fn open(&self, task_id: TaskId) -> ResultSender {
        self.sweep(Instant::now());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sender = ResultSender::new(task_id, tx, cancel.clone());
        self.channels.lock().insert(
            task_id,
            ResultChannel {
                receiver: Some(Arc::new(tokio::sync::Mutex::new(rx))),
                cancel,
                finished: sender.finished(),
            },
        );
        sender
    }

    /// Mark a task cancelled. Idempotent; unknown ids are ignored.
    ///
    /// Returns `true` if the task is known and has not produced its final
    /// result yet.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        self.sweep(Instant::now());
        match self.channels.lock().get(&task_id) {
            Some(channel) if channel.finished_at().is_none() => {
                channel.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait for the next result of `task_id`.
    ///
    /// Returns a final cancelled result straight away if the task was
    /// cancelled. A timeout leaves the task running.
    pub async fn await_result(&self, task_id: TaskId, timeout: Duration) -> Result<TaskResult, ServerError> {
        let (receiver, cancel) = {
            let channels = self.channels.lock();
            let channel = channels.get(&task_id).ok_or(ServerError::UnknownTask(task_id))?;
            let receiver = channel.receiver.clone().ok_or_else(|| {
                ServerError::Validation(format!("task {task_id} is already being streamed"))
            })?;
            (receiver, channel.cancel.clone())
        };

        if cancel.is_cancelled() {
            self.close(task_id);
            return Ok(TaskResult::cancelled(task_id));
        }

        let wait = async {
            let mut rx = receiver.lock().await;
            tokio::select! {
                result = rx.recv() => Some(result),
                _ = cancel.cancelled() => None,
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Err(_) => Err(ServerError::Timeout(task_id)),
            Ok(None) => {
                self.close(task_id);
                Ok(TaskResult::cancelled(task_id))
            }
            Ok(Some(Some(result))) => {
                if result.is_final {
                    self.close(task_id);
                }
                Ok(result)
            }
            Ok(Some(None)) => {
                self.close(task_id);
                Err(ServerError::ShuttingDown)
            }
        }
    }

    /// Hand the channel over as a stream.
    ///
    /// The task stays cancellable until it finishes, and dropping the stream
    /// early cancels it.
    pub fn take_stream(&self, task_id: TaskId) -> Result<ResultStream, ServerError> {
        let mut channels = self.channels.lock();
        let channel = channels.get_mut(&task_id).ok_or(ServerError::UnknownTask(task_id))?;
        let Some(receiver) = channel.receiver.take() else {
            return Err(ServerError::Validation(format!("task {task_id} is already being streamed")));
        };
        match Arc::try_unwrap(receiver) {
            Ok(receiver) => {
                let stream = ResultStream::new(receiver.into_inner(), channel.cancel.clone());
                if channel.finished_at().is_some() {
                    channels.remove(&task_id);
                }
                Ok(stream)
            }
            Err(receiver) => {
                channel.receiver = Some(receiver);
                Err(ServerError::Validation(format!("task {task_id} is already being awaited")))
            }
        }
    }

    /// Drop the entries of finished tasks whose results nobody will read.
    ///
    /// Streamed entries go as soon as the task finished; unread buffered
    /// results are kept for `retention`.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|_, channel| match channel.finished_at() {
            None => true,
            Some(at) => channel.receiver.is_some() && now.saturating_duration_since(at) < self.retention,
        });
        let n_swept = before - channels.len();
        if n_swept > 0 {
            debug!(n_swept, "dropped finished result channels");
        }
        n_swept
    }

    /// Number of open channels.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    fn close(&self, task_id: TaskId) {
        self.channels.lock().remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Payload;
    use futures::StreamExt;

    const RETENTION: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_await_delivers_in_order_and_closes_on_final() {
        let registry = ResultRegistry::new(RETENTION);
        let mut sender = registry.open(1);
        sender.send(TaskResult::partial(1, Payload::Token { token: 10, position: 0 }));
        sender.send(TaskResult::partial(1, Payload::Token { token: 11, position: 1 }));
        sender.send(TaskResult::cancelled(1));

        let timeout = Duration::from_millis(100);
        let first = registry.await_result(1, timeout).await.unwrap();
        assert_eq!(first.payload, Payload::Token { token: 10, position: 0 });
        let second = registry.await_result(1, timeout).await.unwrap();
        assert_eq!(second.payload, Payload::Token { token: 11, position: 1 });
        assert!(registry.await_result(1, timeout).await.unwrap().is_final);

        assert_eq!(registry.len(), 0);
        assert!(matches!(registry.await_result(1, timeout).await, Err(ServerError::UnknownTask(1))));
    }

    #[tokio::test]
    async fn test_timeout_does_not_cancel() {
        let registry = ResultRegistry::new(RETENTION);
        let sender = registry.open(2);
        let res = registry.await_result(2, Duration::from_millis(20)).await;
        assert!(matches!(res, Err(ServerError::Timeout(2))));
        assert!(!sender.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_returns_immediately() {
        let registry = Arc::new(ResultRegistry::new(RETENTION));
        let _sender = registry.open(3);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.await_result(3, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.cancel(3));
        // Idempotent.
        registry.cancel(3);

        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_cancelled());
        assert!(result.is_final);
    }

    #[tokio::test]
    async fn test_take_stream() {
        let registry = ResultRegistry::new(RETENTION);
        let mut sender = registry.open(4);
        let mut stream = registry.take_stream(4).unwrap();
        // Still cancellable, but no longer awaitable.
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.await_result(4, RETENTION).await, Err(ServerError::Validation(_))));

        sender.send(TaskResult::cancelled(4));
        assert!(stream.next().await.unwrap().is_final);
        assert!(stream.next().await.is_none());

        registry.sweep(Instant::now());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_take_stream() {
        let registry = ResultRegistry::new(RETENTION);
        let sender = registry.open(6);
        let _stream = registry.take_stream(6).unwrap();

        assert!(registry.cancel(6));
        assert!(sender.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropping_unfinished_stream_cancels() {
        let registry = ResultRegistry::new(RETENTION);
        let mut sender = registry.open(7);
        let stream = registry.take_stream(7).unwrap();
        drop(stream);
        assert!(sender.is_cancelled());

        // A stream that saw its final result leaves the task alone.
        let mut done = registry.open(8);
        let mut stream = registry.take_stream(8).unwrap();
        done.send(TaskResult::cancelled(8));
        assert!(stream.next().await.unwrap().is_final);
        drop(stream);
        assert!(!done.is_cancelled());
        sender.send(TaskResult::cancelled(7));
    }

    #[tokio::test]
    async fn test_uncollected_results_are_swept_after_retention() {
        let registry = ResultRegistry::new(RETENTION);
        let mut running = registry.open(10);
        for id in 11..31 {
            let mut sender = registry.open(id);
            sender.send(TaskResult::cancelled(id));
        }
        assert_eq!(registry.len(), 21);

        // Inside the retention window the results are still collectable.
        assert_eq!(registry.sweep(Instant::now()), 0);
        assert!(registry.await_result(11, RETENTION).await.unwrap().is_final);

        let later = Instant::now() + RETENTION + Duration::from_secs(1);
        assert_eq!(registry.sweep(later), 19);
        assert_eq!(registry.len(), 1);
        assert!(!registry.cancel(11));
        assert!(registry.cancel(10));
        running.send(TaskResult::cancelled(10));
    }

    #[tokio::test]
    async fn test_cancel_after_final_reports_not_found() {
        let registry = ResultRegistry::new(RETENTION);
        let mut sender = registry.open(12);
        sender.send(TaskResult::cancelled(12));
        assert!(!registry.cancel(12));
        assert!(!sender.is_cancelled());
        // The buffered result is still delivered.
        assert!(registry.await_result(12, RETENTION).await.unwrap().is_final);
    }

    #[tokio::test]
    async fn test_dropped_sender_surfaces_shutdown_error() {
        let registry = ResultRegistry::new(RETENTION);
        let sender = registry.open(5);
        drop(sender);
        let result = registry.await_result(5, Duration::from_millis(50)).await.unwrap();
        assert!(result.is_error());
    }
}
