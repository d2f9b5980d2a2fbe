use std::collections::VecDeque;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use super::queue_item::QueueItem;
use crate::error::ServerError;
use crate::task::{Task, TaskId};

/// # TaskQueue
///
/// Thread-safe FIFO intake of tasks, shared by every submitter and drained
/// only by the scheduler.
///
/// Ids are assigned under the queue lock, so id order and queue order agree.
/// Tasks that cannot run yet (their target slot is busy) are parked on a
/// deferred list and returned to the front of the queue, in arrival order,
/// when a slot is released.
pub(crate) struct TaskQueue {
    state: Mutex<QueueState>,
    capacity: Option<usize>,
    notifier: Arc<Notify>,
}

struct QueueState {
    pending: VecDeque<QueueItem>,
    deferred: VecDeque<QueueItem>,
    next_id: TaskId,
    closed: bool,
}

impl TaskQueue {
    pub fn new(capacity: Option<usize>, notifier: Arc<Notify>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                deferred: VecDeque::new(),
                next_id: 1,
                closed: false,
            }),
            capacity,
            notifier,
        }
    }

    /// Admit a task.
    ///
    /// `admit` runs under the queue lock with the freshly assigned id and
    /// must return the item to enqueue; this is where the caller opens the
    /// task's result channel, so a result can never be produced for a
    /// channel that does not exist yet.
    pub fn submit<F>(&self, mut task: Task, admit: F) -> Result<TaskId, ServerError>
    where
        F: FnOnce(Task) -> QueueItem,
    {
        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ServerError::ShuttingDown);
            }
            if let Some(capacity) = self.capacity {
                if state.pending.len() + state.deferred.len() >= capacity {
                    return Err(ServerError::QueueFull { capacity });
                }
            }
            let id = state.next_id;
            state.next_id += 1;
            task.id = id;
            task.arrival_seq = id;
            state.pending.push_back(admit(task));
            id
        };
        self.notifier.notify_one();
        Ok(id)
    }

    /// Non-blocking pop of the oldest pending task.
    pub fn next_pending(&self) -> Option<QueueItem> {
        self.state.lock().pending.pop_front()
    }

    /// Put a task back at the head of the queue.
    pub fn push_front(&self, item: QueueItem) {
        self.state.lock().pending.push_front(item);
    }

    /// Park a task until a slot is released.
    pub fn defer(&self, item: QueueItem) {
        self.state.lock().deferred.push_back(item);
    }

    /// Move every deferred task back to the head of the queue.
    pub fn requeue_deferred(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.deferred.len();
        while let Some(item) = state.deferred.pop_back() {
            state.pending.push_front(item);
        }
        n
    }

    /// Remove every pending or deferred task matching `predicate`.
    pub fn remove_where<P>(&self, mut predicate: P) -> Vec<QueueItem>
    where
        P: FnMut(&QueueItem) -> bool,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut removed = Vec::new();
        for queue in [&mut state.pending, &mut state.deferred] {
            let mut kept = VecDeque::with_capacity(queue.len());
            for item in queue.drain(..) {
                if predicate(&item) {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *queue = kept;
        }
        removed
    }

    /// Refuse further submissions and hand back everything still queued.
    pub fn close(&self) -> Vec<QueueItem> {
        let mut state = self.state.lock();
        state.closed = true;
        let mut items: Vec<QueueItem> = state.deferred.drain(..).collect();
        items.extend(state.pending.drain(..));
        items
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn n_pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn n_deferred(&self) -> usize {
        self.state.lock().deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.deferred.is_empty()
    }

    /// Wake the scheduler.
    pub fn notify(&self) {
        self.notifier.notify_one();
    }
}
