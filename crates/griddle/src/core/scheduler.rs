use std::cmp::Reverse;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use crate::communication::{Pill, QueueItem, ResultRegistry, TaskQueue};
use crate::config::ServerConfig;
use crate::engine::{Batch, DecodeOutput, Engine, SlotOutput, SpecialTokens, StateBlob};
use crate::error::TaskError;
use crate::task::{Payload, StopReason, Task, TaskKind, TaskResult, Timings};
use crate::tokens::TokenSequence;
use super::batch::{compose, BatchPlan, Contribution, Limits};
use super::checkpoint::CheckpointStore;
use super::slot::{ActiveTask, Slot, SlotSnapshot, SlotState};
use super::slot_file;

/// Cumulative counters and current gauges of a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    /// Prompt positions evaluated by the engine.
    pub n_prompt_tokens_processed: u64,
    /// Prompt positions reused from resident caches or checkpoints.
    pub n_prompt_tokens_cached: u64,
    pub n_tokens_generated: u64,
    pub n_decode_calls: u64,
    /// Sum over decode calls of the slots taking part; divide by
    /// `n_decode_calls` for the mean batch occupancy.
    pub n_busy_slots_total: u64,
    pub n_tasks_completed: u64,
    pub n_tasks_cancelled: u64,
    pub n_tasks_failed: u64,
    pub n_pending: usize,
    pub n_deferred: usize,
    pub n_checkpoints: usize,
    pub checkpoint_bytes: usize,
}

/// A copied view of the scheduler, published after every iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerSnapshot {
    pub slots: Vec<SlotSnapshot>,
    pub metrics: Metrics,
}

/// The prompt a task actually evaluates.
///
/// Infill tasks are wrapped in the engine's fill-in-the-middle markers;
/// `None` if the engine has none.
pub(crate) fn effective_prompt(task: &Task, special: &SpecialTokens) -> Option<TokenSequence> {
    match &task.kind {
        TaskKind::Infill { input_prefix, input_suffix } => {
            let mut prompt = TokenSequence::new();
            prompt.push_token(special.fim_prefix?);
            prompt.extend(input_prefix);
            prompt.push_token(special.fim_suffix?);
            prompt.extend(input_suffix);
            prompt.push_token(special.fim_middle?);
            prompt.extend(&task.prompt);
            Some(prompt)
        }
        _ => Some(task.prompt.clone()),
    }
}

enum Dispatch {
    Handled,
    NoIdleSlot(QueueItem),
}

/// Where the reused prefix of a new task comes from.
enum Reuse {
    /// Keep this many positions of the slot's resident cache.
    Resident(usize),
    /// Restore a checkpoint, then keep this many of its positions.
    Checkpoint { entry: usize, keep: usize },
}

/// # Scheduler
///
/// The single owner of the slot pool, the checkpoint store and the engine.
///
/// Submitters talk to it only through the [`TaskQueue`] and the
/// [`ResultRegistry`]; it publishes its state as a [`ServerSnapshot`]. Each
/// iteration of [`run`](Self::run) makes at most one engine invocation and
/// every task it touches ends with exactly one final result.
pub(crate) struct Scheduler<E: Engine> {
    engine: E,
    config: ServerConfig,
    limits: Limits,
    special: SpecialTokens,
    slots: Vec<Slot>,
    checkpoints: CheckpointStore,
    queue: Arc<TaskQueue>,
    registry: Arc<ResultRegistry>,
    published: watch::Sender<ServerSnapshot>,
    metrics: Metrics,
    tick: u64,
    /// A slot became idle since the deferred tasks were last requeued.
    released: bool,
}

impl<E: Engine> Scheduler<E> {
    pub fn new(
        engine: E,
        config: ServerConfig,
        queue: Arc<TaskQueue>,
        registry: Arc<ResultRegistry>,
        published: watch::Sender<ServerSnapshot>,
    ) -> Self {
        let limits = Limits {
            n_batch: config.n_batch,
            n_ctx_slot: config.n_ctx_slot(),
            n_ctx_total: config.kv_unified.then_some(config.n_ctx),
        };
        let special = engine.special_tokens();
        let slots = (0..config.n_slots).map(Slot::new).collect();
        let checkpoints = CheckpointStore::new(config.checkpoint_budget_bytes, config.max_checkpoints);
        let scheduler = Self {
            engine,
            config,
            limits,
            special,
            slots,
            checkpoints,
            queue,
            registry,
            published,
            metrics: Metrics::default(),
            tick: 0,
            released: false,
        };
        scheduler.publish();
        scheduler
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Sleeps on `notifier` whenever there is nothing to do. On exit every
    /// task still bound to a slot or waiting in the queue receives a final
    /// `ShuttingDown` error.
    pub async fn run(mut self, shutdown: CancellationToken, notifier: Arc<Notify>) {
        let pill = Pill::new(self.queue.clone());
        info!(
            n_slots = self.slots.len(),
            n_ctx = self.config.n_ctx,
            n_ctx_slot = self.limits.n_ctx_slot,
            n_batch = self.limits.n_batch,
            kv_unified = self.config.kv_unified,
            "scheduler started"
        );

        while !shutdown.is_cancelled() {
            self.step().await;
            self.publish();

            if self.is_idle() {
                tokio::select! {
                    _ = notifier.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
            } else {
                // The engine may never suspend; let submitters and consumers run.
                tokio::task::yield_now().await;
            }
        }

        self.stop();
        drop(pill);
        self.publish();
        info!("scheduler stopped");
    }

    /// No active slot and nothing queued or deferred.
    pub fn is_idle(&self) -> bool {
        !self.slots.iter().any(Slot::is_active) && self.queue.is_empty()
    }

    /// One scheduling iteration.
    pub async fn step(&mut self) {
        self.tick += 1;

        self.observe_cancellations();
        if self.released || !self.slots.iter().any(Slot::is_active) {
            let n = self.queue.requeue_deferred();
            if n > 0 {
                debug!(n_tasks = n, "requeued deferred tasks");
            }
            self.released = false;
        }
        self.purge_cancelled();
        self.assign_pending();

        let plan = self.plan_batch();
        for &index in &plan.exhausted {
            self.finish(index, StopReason::ContextExhausted);
        }
        if plan.batch.is_empty() {
            if plan.exhausted.is_empty() {
                self.fail_newest_starved(&plan);
            }
            return;
        }

        let outputs = self.decode(&plan.batch).await;
        self.metrics.n_decode_calls += 1;
        self.metrics.n_busy_slots_total += plan.planned.len() as u64;

        for ((&(index, contribution), entry), output) in plan.planned.iter().zip(&plan.batch.entries).zip(outputs) {
            let result = output.and_then(|output| {
                panic::catch_unwind(AssertUnwindSafe(|| {
                    self.apply_output(index, contribution, &entry.units, output)
                }))
                .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)))
            });
            if let Err(err) = result {
                self.fail_slot(index, err);
            }
        }

        self.observe_cancellations();
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            slots: self.slots.iter().map(Slot::snapshot).collect(),
            metrics: Metrics {
                n_pending: self.queue.n_pending(),
                n_deferred: self.queue.n_deferred(),
                n_checkpoints: self.checkpoints.len(),
                checkpoint_bytes: self.checkpoints.total_bytes(),
                ..self.metrics.clone()
            },
        }
    }

    fn publish(&self) {
        self.published.send_replace(self.snapshot());
    }

    /// Fail everything still in flight.
    fn stop(&mut self) {
        for slot in &mut self.slots {
            if let Some(mut task) = slot.release(self.tick) {
                task.item.reply.fail(TaskError::ShuttingDown);
            }
        }
        let abandoned = self.queue.close();
        if !abandoned.is_empty() {
            info!(n_tasks = abandoned.len(), "failing queued tasks on shutdown");
        }
    }

    /// Answer queued tasks whose consumer cancelled them.
    fn purge_cancelled(&mut self) {
        for mut item in self.queue.remove_where(|item| item.reply.is_cancelled()) {
            debug!(task_id = item.id(), "dropping cancelled queued task");
            item.reply.send(TaskResult::cancelled(item.id()));
            self.metrics.n_tasks_cancelled += 1;
        }
    }

    /// Drain the queue into idle slots, in arrival order.
    fn assign_pending(&mut self) {
        let mut waiting = Vec::new();
        while let Some(item) = self.queue.next_pending() {
            if let Dispatch::NoIdleSlot(item) = self.dispatch(item) {
                waiting.push(item);
            }
        }
        for item in waiting.into_iter().rev() {
            self.queue.push_front(item);
        }
    }

    fn dispatch(&mut self, mut item: QueueItem) -> Dispatch {
        if item.reply.is_cancelled() {
            item.reply.send(TaskResult::cancelled(item.id()));
            self.metrics.n_tasks_cancelled += 1;
            return Dispatch::Handled;
        }
        if item.task.kind.is_admin() {
            self.run_admin(item);
            return Dispatch::Handled;
        }
        self.place(item)
    }

    /// Bind a work task to a slot, reusing the longest available prefix.
    fn place(&mut self, mut item: QueueItem) -> Dispatch {
        let task_id = item.id();
        let Some(prompt) = effective_prompt(&item.task, &self.special) else {
            item.reply.fail(TaskError::Internal("engine has no fill-in-the-middle tokens".into()));
            self.metrics.n_tasks_failed += 1;
            return Dispatch::Handled;
        };

        if prompt.is_empty() {
            item.reply.fail(TaskError::Internal("empty prompt".into()));
            self.metrics.n_tasks_failed += 1;
            return Dispatch::Handled;
        }

        let generates = item.task.kind.generates();
        let n_ctx = self.limits.n_ctx_slot;
        if prompt.len() > n_ctx || (generates && prompt.len() == n_ctx) {
            warn!(task_id, n_prompt = prompt.len(), n_ctx, "prompt does not fit the slot context");
            item.reply.fail(TaskError::ContextOverflow { n_prompt: prompt.len(), n_ctx });
            self.metrics.n_tasks_failed += 1;
            return Dispatch::Handled;
        }

        let mut index = match item.task.target_slot {
            Some(id) if id >= self.slots.len() => {
                item.reply.fail(TaskError::InvalidSlot(id));
                self.metrics.n_tasks_failed += 1;
                return Dispatch::Handled;
            }
            Some(id) if !self.slots[id].is_idle() => {
                debug!(task_id, slot = id, "target slot busy, deferring");
                self.queue.defer(item);
                return Dispatch::Handled;
            }
            Some(id) => id,
            None => match self.pick_slot(&prompt, generates) {
                Some(index) => index,
                None => return Dispatch::NoIdleSlot(item),
            },
        };

        let reuse = if generates {
            // At least one prompt position is always evaluated to get logits.
            let cap = prompt.floor_boundary(prompt.len() - 1);
            let resident = self.slots[index].cache.common_prefix(&prompt).min(cap);
            match self.checkpoints.best_match(&prompt) {
                Some((entry, len)) if len.min(cap) > resident => {
                    if item.task.target_slot.is_none() {
                        index = self.lru_idle_slot().unwrap_or(index);
                    }
                    Reuse::Checkpoint { entry, keep: len.min(cap) }
                }
                _ => Reuse::Resident(resident),
            }
        } else {
            Reuse::Resident(0)
        };
        let n_cached = self.prepare_cache(index, reuse);

        debug!(
            task_id,
            slot = index,
            kind = item.task.kind.name(),
            n_prompt = prompt.len(),
            n_cached,
            "task assigned"
        );
        self.metrics.n_prompt_tokens_cached += n_cached as u64;
        let task = ActiveTask::new(item, prompt, n_cached);
        self.slots[index].bind(task, self.tick);
        Dispatch::Handled
    }

    /// Idle slot with the longest resident match, then least recently used,
    /// then lowest id. Pooling tasks reuse nothing and prefer an empty slot.
    fn pick_slot(&self, prompt: &TokenSequence, generates: bool) -> Option<usize> {
        let idle = self.slots.iter().filter(|slot| slot.is_idle());
        if generates {
            idle.max_by_key(|slot| (slot.cache.common_prefix(prompt), Reverse(slot.last_used), Reverse(slot.id)))
                .map(|slot| slot.id)
        } else {
            idle.min_by_key(|slot| (!slot.cache.is_empty(), slot.last_used))
                .map(|slot| slot.id)
        }
    }

    fn lru_idle_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .filter(|slot| slot.is_idle())
            .min_by_key(|slot| slot.last_used)
            .map(|slot| slot.id)
    }

    /// Bring the slot's partition to the reused prefix. Returns its length.
    fn prepare_cache(&mut self, index: usize, reuse: Reuse) -> usize {
        match reuse {
            Reuse::Resident(keep) => self.truncate_cache(index, keep),
            Reuse::Checkpoint { entry, keep } => {
                let checkpoint = self.checkpoints.use_entry(entry, self.tick);
                let slot = &mut self.slots[index];
                match self.engine.restore_state(slot.seq, &checkpoint.blob) {
                    Ok(()) => {
                        debug!(
                            slot = index,
                            checkpoint = %checkpoint.id,
                            origin_slot = checkpoint.origin_slot,
                            n_positions = checkpoint.prefix.len(),
                            "restored checkpoint"
                        );
                        slot.cache = checkpoint.prefix.clone();
                        self.truncate_cache(index, keep)
                    }
                    Err(err) => {
                        warn!(slot = index, %err, "checkpoint restore failed");
                        self.clear_cache(index);
                        0
                    }
                }
            }
        }
    }

    fn truncate_cache(&mut self, index: usize, keep: usize) -> usize {
        let slot = &mut self.slots[index];
        let keep = slot.cache.floor_boundary(keep);
        if keep == slot.cache.len() {
            return keep;
        }
        match self.engine.truncate(slot.seq, keep) {
            Ok(()) => slot.cache.keep_first(keep),
            Err(err) => {
                warn!(slot = index, %err, "truncate failed, clearing slot");
                self.clear_cache(index);
                0
            }
        }
    }

    /// Empty a slot's partition. Used whenever its contents are unknown.
    fn clear_cache(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if let Err(err) = self.engine.truncate(slot.seq, 0) {
            error!(slot = index, %err, "could not clear slot partition");
        }
        slot.cache = TokenSequence::new();
    }

    /// Drop the resident cache of the least recently used idle slot.
    fn reclaim_idle_cache(&mut self, exclude: Option<usize>) -> bool {
        let victim = self
            .slots
            .iter()
            .filter(|slot| slot.is_idle() && !slot.cache.is_empty() && Some(slot.id) != exclude)
            .min_by_key(|slot| slot.last_used)
            .map(|slot| slot.id);
        let Some(index) = victim else {
            return false;
        };
        let slot = &mut self.slots[index];
        match self.engine.truncate(slot.seq, 0) {
            Ok(()) => {
                debug!(slot = index, n_positions = slot.cache.len(), "reclaimed idle slot cache");
                slot.cache = TokenSequence::new();
                true
            }
            Err(err) => {
                warn!(slot = index, %err, "could not reclaim idle slot cache");
                false
            }
        }
    }

    fn plan_batch(&mut self) -> BatchPlan {
        loop {
            let plan = compose(&self.slots, &self.limits);
            if plan.needs_room() && self.limits.n_ctx_total.is_some() && self.reclaim_idle_cache(None) {
                continue;
            }
            return plan;
        }
    }

    /// Nothing could be batched although prompts are waiting for cache room
    /// that will never free up: give up on the most recent of them.
    fn fail_newest_starved(&mut self, plan: &BatchPlan) {
        let newest = plan
            .starved
            .iter()
            .copied()
            .filter_map(|index| self.slots[index].task.as_ref().map(|t| (index, t.item.task.arrival_seq, t.prompt.len())))
            .max_by_key(|&(_, arrival, _)| arrival);
        if let Some((index, _, n_prompt)) = newest {
            let n_ctx = self.limits.n_ctx_total.unwrap_or(self.limits.n_ctx_slot);
            self.fail_slot(index, TaskError::ContextOverflow { n_prompt, n_ctx });
        }
    }

    /// Run the batch, isolating the culprits if the whole invocation fails.
    async fn decode(&mut self, batch: &Batch) -> Vec<Result<SlotOutput, TaskError>> {
        match self.invoke(batch).await {
            Ok(outputs) => outputs.into_iter().map(|o| o.map_err(TaskError::from)).collect(),
            Err(err) if batch.len() == 1 => vec![Err(err)],
            Err(err) => {
                warn!(%err, n_entries = batch.len(), "batch failed, retrying entries one at a time");
                let mut outputs = Vec::with_capacity(batch.len());
                for entry in &batch.entries {
                    let output = match self.invoke(&Batch::single(entry.clone())).await {
                        Ok(mut single) => match single.pop() {
                            Some(output) => output.map_err(TaskError::from),
                            None => Err(TaskError::Engine("engine returned no output".into())),
                        },
                        Err(err) => Err(err),
                    };
                    outputs.push(output);
                }
                outputs
            }
        }
    }

    /// One engine call. A panic or a misaligned output fails the whole call.
    async fn invoke(&mut self, batch: &Batch) -> Result<DecodeOutput, TaskError> {
        let outputs = AssertUnwindSafe(self.engine.decode(batch))
            .catch_unwind()
            .await
            .map_err(TaskError::from_panic)??;
        if outputs.len() != batch.len() {
            return Err(TaskError::Engine(format!(
                "engine returned {} outputs for {} entries",
                outputs.len(),
                batch.len()
            )));
        }
        Ok(outputs)
    }

    /// Fold one entry's output into its slot and move the slot along.
    fn apply_output(
        &mut self,
        index: usize,
        contribution: Contribution,
        units: &TokenSequence,
        output: SlotOutput,
    ) -> Result<(), TaskError> {
        let slot = &mut self.slots[index];
        slot.cache.extend(units);

        if let Contribution::Prompt { last } = contribution {
            let Some(task) = slot.task.as_mut() else {
                return Ok(());
            };
            task.timings.n_prompt_processed += units.len();
            self.metrics.n_prompt_tokens_processed += units.len() as u64;
            if !last {
                return Ok(());
            }
            task.prompt_done_at = Some(Instant::now());
            if !task.kind().generates() {
                return self.finish_pooled(index, output);
            }
            let max_tokens = task.item.task.max_output_tokens;
            slot.transition(SlotState::Generating);
            if max_tokens == Some(0) {
                self.finish(index, StopReason::MaxTokens);
                return Ok(());
            }
        }

        match output {
            SlotOutput::Logits(logits) => self.accept_token(index, &logits),
            _ => Err(TaskError::Engine("engine returned no logits".into())),
        }
    }

    /// Sample the next token and check the stop conditions.
    fn accept_token(&mut self, index: usize, logits: &[f32]) -> Result<(), TaskError> {
        let n_ctx_slot = self.limits.n_ctx_slot;
        let eos = self.special.eos;
        let slot = &mut self.slots[index];
        let n_past = slot.n_past();
        let Some(task) = slot.task.as_mut() else {
            return Ok(());
        };
        let task_id = task.id();

        let sampler = task
            .sampler
            .as_mut()
            .ok_or_else(|| TaskError::Internal("generating task has no sampler".into()))?;
        let token = sampler
            .sample(logits)
            .ok_or_else(|| TaskError::Engine("engine returned empty logits".into()))?;

        let params = &task.item.task.sampling;
        let stop = if eos == Some(token) && !params.ignore_eos {
            Some(StopReason::Eos)
        } else {
            task.generated.push(token);
            self.metrics.n_tokens_generated += 1;
            if task.item.task.stream {
                let position = task.generated.len() - 1;
                task.item.reply.send(TaskResult::partial(task_id, Payload::Token { token, position }));
            }

            if params.stop.iter().any(|s| !s.is_empty() && task.generated.ends_with(s)) {
                Some(StopReason::StopSequence)
            } else if task.item.task.max_output_tokens.is_some_and(|max| task.generated.len() >= max) {
                Some(StopReason::MaxTokens)
            } else if n_past + 1 > n_ctx_slot {
                Some(StopReason::ContextExhausted)
            } else {
                task.pending_token = Some(token);
                None
            }
        };

        if let Some(reason) = stop {
            self.finish(index, reason);
        }
        Ok(())
    }

    fn finish(&mut self, index: usize, reason: StopReason) {
        self.slots[index].transition(SlotState::Completed);
        self.retain_checkpoint(index);
        let Some(mut task) = self.slots[index].release(self.tick) else {
            return;
        };
        self.released = true;

        let timings = task.finish_timings();
        let n_generated = task.generated.len();
        let tokens = if task.item.task.stream {
            Vec::new()
        } else {
            std::mem::take(&mut task.generated)
        };
        debug!(slot = index, task_id = task.id(), ?reason, n_generated, "task completed");
        let payload = Payload::Completion { tokens, stop_reason: reason, n_generated };
        task.item.reply.send(TaskResult::last(task.id(), payload, timings));
        self.metrics.n_tasks_completed += 1;
    }

    /// Complete an embedding or rerank task from its pooled output.
    fn finish_pooled(&mut self, index: usize, output: SlotOutput) -> Result<(), TaskError> {
        let SlotOutput::Embedding(embedding) = output else {
            return Err(TaskError::Engine("engine returned no embedding".into()));
        };
        let is_rerank = matches!(self.slots[index].task.as_ref().map(ActiveTask::kind), Some(TaskKind::Rerank));
        let payload = if is_rerank {
            let score = embedding
                .first()
                .copied()
                .ok_or_else(|| TaskError::Engine("engine returned an empty rerank score".into()))?;
            Payload::Rerank { score }
        } else {
            Payload::Embedding(embedding)
        };

        self.slots[index].transition(SlotState::Completed);
        if let Some(mut task) = self.slots[index].release(self.tick) {
            debug!(slot = index, task_id = task.id(), kind = task.kind().name(), "task completed");
            let timings = task.finish_timings();
            task.item.reply.send(TaskResult::last(task.id(), payload, timings));
            self.metrics.n_tasks_completed += 1;
        }
        self.released = true;
        Ok(())
    }

    fn fail_slot(&mut self, index: usize, err: TaskError) {
        if self.slots[index].is_idle() {
            return;
        }
        if self.slots[index].is_active() {
            self.slots[index].transition(SlotState::Failed);
        }
        self.clear_cache(index);
        if let Some(mut task) = self.slots[index].release(self.tick) {
            warn!(slot = index, task_id = task.id(), %err, "task failed");
            task.item.reply.fail(err);
            self.metrics.n_tasks_failed += 1;
        }
        self.released = true;
    }

    /// Free every slot whose task was cancelled. The cache stays resident.
    fn observe_cancellations(&mut self) {
        for index in 0..self.slots.len() {
            let cancelled = self.slots[index]
                .task
                .as_ref()
                .is_some_and(|task| task.item.reply.is_cancelled());
            if !cancelled || !self.slots[index].is_active() {
                continue;
            }
            self.slots[index].transition(SlotState::Cancelled);
            self.retain_checkpoint(index);
            if let Some(mut task) = self.slots[index].release(self.tick) {
                debug!(slot = index, task_id = task.id(), "task cancelled");
                let timings = task.finish_timings();
                task.item.reply.send(TaskResult::last(task.id(), Payload::Cancelled, timings));
                self.metrics.n_tasks_cancelled += 1;
            }
            self.released = true;
        }
    }

    fn retain_checkpoint(&mut self, index: usize) {
        let slot = &self.slots[index];
        if !self.checkpoints.is_enabled()
            || slot.cache.len() < self.config.checkpoint_min_tokens
            || self.checkpoints.contains(&slot.cache)
        {
            return;
        }
        match self.engine.save_state(slot.seq) {
            Ok(blob) => {
                let n_bytes = blob.len();
                if self.checkpoints.insert(slot.id, slot.cache.clone(), blob, self.tick) {
                    debug!(slot = index, n_positions = slot.cache.len(), n_bytes, "retained checkpoint");
                }
            }
            Err(err) => warn!(slot = index, %err, "could not checkpoint slot"),
        }
    }

    /// Save, restore, erase and cancel tasks. They never occupy a slot.
    fn run_admin(&mut self, mut item: QueueItem) {
        let task_id = item.id();
        if let TaskKind::Cancel { target } = item.task.kind {
            let found = self.registry.cancel(target);
            debug!(task_id, target, found, "cancel requested");
            let payload = Payload::CancelRequested { target, found };
            item.reply.send(TaskResult::last(task_id, payload, Timings::default()));
            return;
        }

        let Some(slot_id) = item.task.admin_slot() else {
            item.reply.fail(TaskError::Internal(format!("{} is not a slot task", item.task.kind.name())));
            return;
        };
        if slot_id >= self.slots.len() {
            item.reply.fail(TaskError::InvalidSlot(slot_id));
            return;
        }
        if !self.slots[slot_id].is_idle() {
            debug!(task_id, slot = slot_id, kind = item.task.kind.name(), "slot busy, deferring");
            self.queue.defer(item);
            return;
        }

        let result = match &item.task.kind {
            TaskKind::SaveSlot { filename, .. } => self.save_slot(slot_id, filename),
            TaskKind::RestoreSlot { filename, .. } => self.restore_slot(slot_id, filename),
            TaskKind::EraseSlot { .. } => self.erase_slot(slot_id),
            kind => Err(TaskError::Internal(format!("{} is not a slot task", kind.name()))),
        };
        match result {
            Ok(payload) => {
                item.reply.send(TaskResult::last(task_id, payload, Timings::default()));
            }
            Err(err) => {
                warn!(task_id, slot = slot_id, %err, "slot operation failed");
                item.reply.fail(err);
            }
        }
    }

    fn save_slot(&mut self, slot_id: usize, filename: &str) -> Result<Payload, TaskError> {
        let path = slot_file::resolve(self.config.slot_save_path.as_deref(), filename)?;
        let slot = &self.slots[slot_id];
        let blob = if slot.cache.is_empty() {
            StateBlob(Vec::new())
        } else {
            self.engine.save_state(slot.seq)?
        };
        let n_bytes = slot_file::write(&path, &slot.cache, &blob)?;
        info!(slot = slot_id, n_saved = slot.cache.len(), n_bytes, path = %path.display(), "slot saved");
        Ok(Payload::SlotSaved {
            slot_id,
            filename: filename.to_string(),
            n_saved: slot.cache.len(),
            n_bytes,
        })
    }

    fn restore_slot(&mut self, slot_id: usize, filename: &str) -> Result<Payload, TaskError> {
        let path = slot_file::resolve(self.config.slot_save_path.as_deref(), filename)?;
        let (tokens, blob) = slot_file::read(&path)?;
        if tokens.is_empty() != blob.is_empty() {
            return Err(TaskError::SlotFile(format!("{} is inconsistent", path.display())));
        }
        if tokens.len() > self.limits.n_ctx_slot {
            return Err(TaskError::SlotFile(format!(
                "{} holds {} positions, more than the slot context of {}",
                path.display(),
                tokens.len(),
                self.limits.n_ctx_slot
            )));
        }
        if let Some(total) = self.limits.n_ctx_total {
            let others = |slots: &[Slot]| -> usize {
                slots.iter().filter(|s| s.id != slot_id).map(Slot::n_past).sum()
            };
            while others(&self.slots) + tokens.len() > total {
                if !self.reclaim_idle_cache(Some(slot_id)) {
                    return Err(TaskError::SlotFile(format!(
                        "no cache room for the {} positions of {}",
                        tokens.len(),
                        path.display()
                    )));
                }
            }
        }

        let slot = &mut self.slots[slot_id];
        let restored = if blob.is_empty() {
            self.engine.truncate(slot.seq, 0)
        } else {
            self.engine.restore_state(slot.seq, &blob)
        };
        if let Err(err) = restored {
            self.clear_cache(slot_id);
            return Err(err.into());
        }
        slot.cache = tokens;
        info!(slot = slot_id, n_restored = slot.cache.len(), path = %path.display(), "slot restored");
        Ok(Payload::SlotRestored {
            slot_id,
            filename: filename.to_string(),
            n_restored: slot.cache.len(),
        })
    }

    fn erase_slot(&mut self, slot_id: usize) -> Result<Payload, TaskError> {
        let slot = &mut self.slots[slot_id];
        let n_erased = slot.cache.len();
        self.engine.truncate(slot.seq, 0)?;
        slot.cache = TokenSequence::new();
        info!(slot = slot_id, n_erased, "slot erased");
        Ok(Payload::SlotErased { slot_id, n_erased })
    }
}
