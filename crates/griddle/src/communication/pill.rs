use std::sync::Arc;
use std::thread;
use tracing::{error, info};
use super::queue::TaskQueue;

/// # Pill
///
/// A drop guard owned by the scheduler task that makes sure no submitter is
/// left waiting once the scheduler stops, however it stops.
///
/// ## Purpose
///
/// The scheduler loop exits on shutdown, is aborted on a forced stop, and
/// could in principle unwind from a panic. In all three cases the `Pill` is
/// dropped with the task's state. On drop it closes the task queue, so new
/// submissions fail with `ShuttingDown`, and drops every task still queued.
/// Dropping a queued task's result sender emits its final error result.
///
/// Tasks bound to slots are owned by the scheduler's slot pool and are
/// released the same way when the pool is dropped.
pub(crate) struct Pill {
    queue: Arc<TaskQueue>,
}

impl Pill {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

impl Drop for Pill {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("scheduler panicked, failing all outstanding tasks");
        }
        let abandoned = self.queue.close();
        if !abandoned.is_empty() {
            info!(n_tasks = abandoned.len(), "failing queued tasks on scheduler exit");
        }
        drop(abandoned);
    }
}
