//! Execution lanes and their per-request state machine.

use std::time::Instant;
use serde::Serialize;
use crate::communication::QueueItem;
use crate::engine::SequenceId;
use crate::sampling::Sampler;
use crate::task::{TaskId, TaskKind, Timings};
use crate::tokens::{TokenId, TokenSequence};

/// Lifecycle of a slot.
///
/// `Idle → Prefilling → Generating → {Completed | Cancelled | Failed} → Idle`.
/// The three outcome states are transient: the scheduler moves the slot back
/// to `Idle` in the same iteration, after it has emitted the final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotState {
    Idle,
    Prefilling,
    Generating,
    Completed,
    Cancelled,
    Failed,
}

impl SlotState {
    pub fn is_active(self) -> bool {
        matches!(self, SlotState::Prefilling | SlotState::Generating)
    }

    fn can_become(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Idle, Prefilling)
                | (Prefilling, Generating)
                | (Prefilling, Completed)
                | (Generating, Completed)
                | (Prefilling | Generating, Cancelled)
                | (Prefilling | Generating, Failed)
                | (Completed | Cancelled | Failed, Idle)
        )
    }
}

/// The task a slot is working on.
pub(crate) struct ActiveTask {
    pub item: QueueItem,
    /// Effective prompt (infill prompts are assembled at assignment).
    pub prompt: TokenSequence,
    pub sampler: Option<Sampler>,
    pub generated: Vec<TokenId>,
    /// Sampled but not yet decoded; it is fed to the engine next iteration.
    pub pending_token: Option<TokenId>,
    pub timings: Timings,
    pub started_at: Instant,
    pub prompt_done_at: Option<Instant>,
}

impl ActiveTask {
    pub fn new(item: QueueItem, prompt: TokenSequence, n_cached: usize) -> Self {
        let sampler = item
            .task
            .kind
            .generates()
            .then(|| Sampler::new(item.task.sampling.clone()));
        Self {
            item,
            prompt,
            sampler,
            generated: Vec::new(),
            pending_token: None,
            timings: Timings {
                n_cached,
                ..Timings::default()
            },
            started_at: Instant::now(),
            prompt_done_at: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.item.id()
    }

    pub fn kind(&self) -> &TaskKind {
        &self.item.task.kind
    }

    /// Close the timing counters before the final result goes out.
    pub fn finish_timings(&mut self) -> Timings {
        let now = Instant::now();
        let prompt_end = self.prompt_done_at.unwrap_or(now);
        self.timings.prompt_ms = prompt_end.duration_since(self.started_at).as_secs_f64() * 1000.0;
        self.timings.generation_ms = match self.prompt_done_at {
            Some(t) => now.duration_since(t).as_secs_f64() * 1000.0,
            None => 0.0,
        };
        self.timings.n_generated = self.generated.len();
        self.timings.clone()
    }
}

/// # Slot
///
/// One execution lane bound to its own KV cache partition.
///
/// `cache` mirrors exactly what the engine holds for `seq`; its length is the
/// slot's `n_past`. Every engine call that changes the partition is followed
/// by the matching update of `cache`, and a failed call clears both.
pub(crate) struct Slot {
    pub id: usize,
    pub seq: SequenceId,
    state: SlotState,
    pub task: Option<ActiveTask>,
    pub cache: TokenSequence,
    /// Scheduler tick of the last assignment or release, for LRU choices.
    pub last_used: u64,
}

impl Slot {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            seq: id,
            state: SlotState::Idle,
            task: None,
            cache: TokenSequence::new(),
            last_used: 0,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn n_past(&self) -> usize {
        self.cache.len()
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Move to `next`. Illegal transitions are a scheduler bug.
    pub fn transition(&mut self, next: SlotState) {
        debug_assert!(
            self.state.can_become(next),
            "slot {}: illegal transition {:?} -> {:?}",
            self.id,
            self.state,
            next
        );
        self.state = next;
    }

    /// Bind a task. The slot must be idle.
    pub fn bind(&mut self, task: ActiveTask, tick: u64) {
        self.task = Some(task);
        self.last_used = tick;
        self.transition(SlotState::Prefilling);
    }

    /// Unbind the current task and return to `Idle`.
    pub fn release(&mut self, tick: u64) -> Option<ActiveTask> {
        self.last_used = tick;
        if self.state != SlotState::Idle {
            if self.state.is_active() {
                // Released without an outcome (shutdown).
                self.state = SlotState::Cancelled;
            }
            self.transition(SlotState::Idle);
        }
        self.task.take()
    }

    /// Prompt positions still to be prefilled.
    pub fn remaining_prompt(&self) -> usize {
        match &self.task {
            Some(task) => task.prompt.len().saturating_sub(self.cache.len()),
            None => 0,
        }
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            id: self.id,
            state: self.state,
            task_id: self.task.as_ref().map(ActiveTask::id),
            n_past: self.n_past(),
            n_prompt: self.task.as_ref().map_or(0, |t| t.prompt.len()),
            n_generated: self.task.as_ref().map_or(0, |t| t.generated.len()),
        }
    }
}

/// A copied, read-only view of a slot for introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSnapshot {
    pub id: usize,
    pub state: SlotState,
    pub task_id: Option<TaskId>,
    pub n_past: usize,
    pub n_prompt: usize,
    pub n_generated: usize,
}

impl SlotSnapshot {
    pub fn is_processing(&self) -> bool {
        self.state.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::ResultSender;
    use crate::task::Task;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn active(task: Task) -> ActiveTask {
        let (tx, _rx) = mpsc::unbounded_channel();
        let reply = ResultSender::new(task.id, tx, CancellationToken::new());
        let prompt = task.prompt.clone();
        let mut active = ActiveTask::new(QueueItem::new(task, reply), prompt, 0);
        // Keep the test channel quiet on drop.
        active.item.reply.send(crate::task::TaskResult::cancelled(0));
        active
    }

    #[test]
    fn test_lifecycle() {
        let mut slot = Slot::new(0);
        assert!(slot.is_idle());

        slot.bind(active(Task::generate(vec![1, 2, 3], 4)), 1);
        assert_eq!(slot.state(), SlotState::Prefilling);
        assert_eq!(slot.remaining_prompt(), 3);

        slot.cache.extend(&TokenSequence::from_tokens([1, 2, 3]));
        slot.transition(SlotState::Generating);
        assert_eq!(slot.remaining_prompt(), 0);

        slot.transition(SlotState::Completed);
        assert!(slot.release(2).is_some());
        assert!(slot.is_idle());
        assert_eq!(slot.n_past(), 3);
        assert_eq!(slot.last_used, 2);
    }

    #[test]
    fn test_transition_table() {
        assert!(SlotState::Idle.can_become(SlotState::Prefilling));
        assert!(SlotState::Generating.can_become(SlotState::Cancelled));
        assert!(!SlotState::Idle.can_become(SlotState::Generating));
        assert!(!SlotState::Completed.can_become(SlotState::Generating));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut slot = Slot::new(3);
        slot.bind(active(Task::generate(vec![1, 2], 4)), 1);
        let snap = slot.snapshot();
        slot.cache.push_token(1);
        assert_eq!(snap.n_past, 0);
        assert_eq!(snap.n_prompt, 2);
        assert!(snap.is_processing());
    }
}
