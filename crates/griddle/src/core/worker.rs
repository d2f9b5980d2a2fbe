//! Module for handling the background scheduler task.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A handle for managing a background worker task.
///
/// This struct spawns a long-running task, wakes it when new work arrives and
/// stops it. Stopping escalates: the first [`shutdown`](Self::shutdown)
/// cancels the shutdown token so the task can finish its current iteration
/// and release everything it holds; a second call aborts the task outright.
///
/// # Example
///
/// ```ignore
/// let worker = WorkerHandle::new(|shutdown, notifier| {
///     tokio::spawn(async move {
///         loop {
///             tokio::select! {
///                 _ = notifier.notified() => println!("Notified!"),
///                 _ = shutdown.cancelled() => break,
///             }
///         }
///     })
/// });
///
/// worker.notify();
/// worker.shutdown();
/// worker.join().await;
/// ```
pub(crate) struct WorkerHandle {
    /// Cancelled on the first shutdown request
    shutdown: CancellationToken,

    /// Notification mechanism to wake up the background task
    notifier: Arc<Notify>,

    /// Handle to the spawned task, taken by the first joiner
    handle: Mutex<Option<JoinHandle<()>>>,

    /// Aborts the task on the second shutdown request
    abort: AbortHandle,

    /// Cancelled once a joiner has observed the task exit
    finished: CancellationToken,

    stop_requests: AtomicUsize,
}

impl WorkerHandle {
    /// Creates a new `WorkerHandle` by spawning a background task.
    ///
    /// # Parameters
    ///
    /// * `task` - A function that takes the shutdown token and a notifier, and
    ///   returns the `JoinHandle` of the task it spawned.
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce(CancellationToken, Arc<Notify>) -> JoinHandle<()>,
    {
        Self::with_notifier(Arc::new(Notify::new()), task)
    }

    /// Like [`new`](Self::new), sharing an existing notifier with the task.
    pub fn with_notifier<F>(notifier: Arc<Notify>, task: F) -> Self
    where
        F: FnOnce(CancellationToken, Arc<Notify>) -> JoinHandle<()>,
    {
        let shutdown = CancellationToken::new();
        let handle = task(shutdown.clone(), notifier.clone());
        let abort = handle.abort_handle();

        Self {
            shutdown,
            notifier,
            handle: Mutex::new(Some(handle)),
            abort,
            finished: CancellationToken::new(),
            stop_requests: AtomicUsize::new(0),
        }
    }

    /// Wakes the background task up.
    pub fn notify(&self) {
        self.notifier.notify_one();
    }

    /// `true` until a shutdown was requested and the task has exited.
    pub fn is_running(&self) -> bool {
        !self.abort.is_finished()
    }

    /// `true` once any shutdown was requested.
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Requests a stop.
    ///
    /// The first call is graceful. Any later call aborts the task at its next
    /// suspension point. Returns `true` if this call forced the stop.
    pub fn shutdown(&self) -> bool {
        let previous = self.stop_requests.fetch_add(1, Ordering::SeqCst);
        self.shutdown.cancel();
        self.notifier.notify_one();
        if previous > 0 && !self.abort.is_finished() {
            warn!("forcing background task to stop");
            self.abort.abort();
            return true;
        }
        false
    }

    /// Waits for the background task to exit.
    ///
    /// Does not request a stop by itself. Safe to call from several places;
    /// every caller returns once the task is gone.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        warn!("background task panicked");
                    }
                }
                self.finished.cancel();
            }
            None => self.finished.cancelled().await,
        }
    }
}

impl Drop for WorkerHandle {
    /// Ensures the background task is asked to stop when the handle is dropped.
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.notifier.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::time;

    fn idle_worker(exited: Arc<AtomicBool>) -> WorkerHandle {
        WorkerHandle::new(move |shutdown, notifier| {
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = notifier.notified() => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                exited.store(true, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_worker_starts_running() {
        let worker = idle_worker(Arc::new(AtomicBool::new(false)));
        assert!(worker.is_running());
        assert!(!worker.is_stopping());
    }

    #[tokio::test]
    async fn test_worker_notifies() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let worker = WorkerHandle::new(move |shutdown, notifier| {
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = notifier.notified() => { count_clone.fetch_add(1, Ordering::SeqCst); }
                        _ = shutdown.cancelled() => break,
                    }
                }
            })
        });

        time::sleep(Duration::from_millis(20)).await;
        worker.notify();
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        worker.notify();
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_worker_graceful_shutdown() {
        let exited = Arc::new(AtomicBool::new(false));
        let worker = idle_worker(exited.clone());

        assert!(!worker.shutdown());
        worker.join().await;

        assert!(exited.load(Ordering::SeqCst));
        assert!(!worker.is_running());
        // Joining again returns at once.
        worker.join().await;
    }

    #[tokio::test]
    async fn test_second_shutdown_aborts() {
        let exited = Arc::new(AtomicBool::new(false));
        let exited_clone = exited.clone();

        // Ignores the shutdown token entirely.
        let worker = WorkerHandle::new(move |_shutdown, _notifier| {
            tokio::spawn(async move {
                time::sleep(Duration::from_secs(3600)).await;
                exited_clone.store(true, Ordering::SeqCst);
            })
        });

        assert!(!worker.shutdown());
        time::sleep(Duration::from_millis(20)).await;
        assert!(worker.is_running());

        assert!(worker.shutdown());
        worker.join().await;
        assert!(!worker.is_running());
        assert!(!exited.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_worker_drop_triggers_shutdown() {
        let exited = Arc::new(AtomicBool::new(false));
        {
            let worker = idle_worker(exited.clone());
            worker.notify();
            time::sleep(Duration::from_millis(20)).await;
        }
        time::sleep(Duration::from_millis(50)).await;
        assert!(exited.load(Ordering::SeqCst));
    }
}
