use crate::engine::{Batch, BatchEntry, OutputKind};
use crate::tokens::TokenSequence;
use super::slot::{Slot, SlotState};

/// Capacity limits a batch is composed under.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    /// Positions per engine invocation.
    pub n_batch: usize,
    /// Positions a single slot may hold.
    pub n_ctx_slot: usize,
    /// Positions all slots may hold together, with a unified cache.
    pub n_ctx_total: Option<usize>,
}

/// What a batch entry contributes for its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Contribution {
    /// The token sampled in the previous iteration.
    Token,
    /// A chunk of the prompt; `last` when it completes the prompt.
    Prompt { last: bool },
}

/// A composed batch together with the bookkeeping needed to demultiplex it.
#[derive(Debug, Default)]
pub(crate) struct BatchPlan {
    pub batch: Batch,
    /// Slot index and contribution per entry, aligned with `batch.entries`.
    pub planned: Vec<(usize, Contribution)>,
    /// Generating slots that could not get a position for their next token.
    pub exhausted: Vec<usize>,
    /// Prefilling slots left out for lack of cache headroom.
    pub starved: Vec<usize>,
}

impl BatchPlan {
    /// The plan would leave some slot without room.
    pub fn needs_room(&self) -> bool {
        !self.exhausted.is_empty() || !self.starved.is_empty()
    }
}

/// # compose
///
/// Builds the next batch from the slots' current states.
///
/// Every generating slot contributes its pending token first. Prefilling
/// slots follow, oldest task first, each with as much of its remaining prompt
/// as fits the rest of the `n_batch` budget, its own context and the shared
/// cache headroom. Media chunks are never split; a chunk larger than the whole
/// budget is submitted alone. Embedding and rerank prompts are submitted in a
/// single piece since their output pools over the whole sequence.
///
/// # Parameters
///
/// * `slots` - The slot pool, indexed by slot id
/// * `limits` - Batch and context capacities
///
/// # Returns
///
/// The batch and, for each entry, which slot it belongs to and what it carries.
pub(crate) fn compose(slots: &[Slot], limits: &Limits) -> BatchPlan {
    let mut plan = BatchPlan::default();
    let mut budget = limits.n_batch;
    let mut headroom = limits
        .n_ctx_total
        .map(|total| total.saturating_sub(slots.iter().map(Slot::n_past).sum()));

    for (index, slot) in slots.iter().enumerate() {
        if slot.state() != SlotState::Generating {
            continue;
        }
        let Some(token) = slot.task.as_ref().and_then(|t| t.pending_token) else {
            continue;
        };
        if slot.n_past() + 1 > limits.n_ctx_slot || headroom == Some(0) {
            plan.exhausted.push(index);
            continue;
        }
        if budget == 0 {
            break;
        }
        let mut units = TokenSequence::new();
        units.push_token(token);
        plan.batch.push(BatchEntry {
            seq: slot.seq,
            pos: slot.n_past(),
            units,
            output: OutputKind::Logits,
        });
        plan.planned.push((index, Contribution::Token));
        budget -= 1;
        if let Some(room) = headroom.as_mut() {
            *room -= 1;
        }
    }

    let mut prefilling: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.state() == SlotState::Prefilling && slot.remaining_prompt() > 0)
        .map(|(index, _)| index)
        .collect();
    prefilling.sort_by_key(|&index| slots[index].task.as_ref().map_or(u64::MAX, |t| t.item.task.arrival_seq));

    for index in prefilling {
        if budget == 0 {
            break;
        }
        let slot = &slots[index];
        let Some(task) = slot.task.as_ref() else {
            continue;
        };
        let start = slot.n_past();
        let room = headroom.unwrap_or(usize::MAX);
        let chunk = if task.kind().generates() {
            task.prompt.chunk_from(start, budget.min(limits.n_ctx_slot.saturating_sub(start)).min(room))
        } else {
            task.prompt.chunk_from(start, usize::MAX)
        };
        if chunk.is_empty() {
            continue;
        }
        if chunk.len() > room || start + chunk.len() > limits.n_ctx_slot {
            plan.starved.push(index);
            continue;
        }
        if chunk.len() > budget && !plan.batch.is_empty() {
            // Does not fit next to what is already batched; next iteration.
            continue;
        }

        let last = start + chunk.len() == task.prompt.len();
        let output = match (last, task.kind().generates()) {
            (false, _) => OutputKind::None,
            (true, true) => OutputKind::Logits,
            (true, false) => OutputKind::Embedding,
        };
        budget = budget.saturating_sub(chunk.len());
        if let Some(room) = headroom.as_mut() {
            *room -= chunk.len();
        }
        plan.batch.push(BatchEntry {
            seq: slot.seq,
            pos: start,
            units: chunk,
            output,
        });
        plan.planned.push((index, Contribution::Prompt { last }));
    }

    plan
}
