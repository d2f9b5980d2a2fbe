//! Units of submitted work ([`Task`]) and of produced output ([`TaskResult`]).

use serde::{Deserialize, Serialize};
use crate::error::TaskError;
use crate::tokens::{TokenId, TokenSequence};

/// Identifier assigned to a task when it is admitted.
pub type TaskId = u64;

/// Parameters the sampler uses to pick the next token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// `0.0` selects greedy decoding.
    pub temperature: f32,
    /// Keep only the `top_k` most likely tokens. `0` disables the filter.
    pub top_k: usize,
    /// Seed for reproducible sampling. `None` draws from entropy.
    pub seed: Option<u64>,
    /// Token sequences that end generation when produced.
    pub stop: Vec<Vec<TokenId>>,
    /// Keep generating past the end-of-sequence token.
    pub ignore_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            seed: None,
            stop: Vec::new(),
            ignore_eos: false,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }
}

/// What a task asks the scheduler to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Autoregressive completion of the prompt.
    Generate,
    /// Pooled embedding of the prompt.
    Embed,
    /// Relevance score of a pre-formatted query/document prompt.
    Rerank,
    /// Fill-in-the-middle completion between `input_prefix` and `input_suffix`.
    Infill {
        input_prefix: TokenSequence,
        input_suffix: TokenSequence,
    },
    /// Persist a slot's cache to `filename` under the slot save directory.
    SaveSlot { slot_id: usize, filename: String },
    /// Load a slot's cache from `filename`.
    RestoreSlot { slot_id: usize, filename: String },
    /// Drop a slot's resident cache.
    EraseSlot { slot_id: usize },
    /// Cancel another task.
    Cancel { target: TaskId },
}

impl TaskKind {
    /// Administrative tasks never occupy a slot.
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            TaskKind::SaveSlot { .. }
                | TaskKind::RestoreSlot { .. }
                | TaskKind::EraseSlot { .. }
                | TaskKind::Cancel { .. }
        )
    }

    /// Tasks that sample new tokens after prefill.
    pub fn generates(&self) -> bool {
        matches!(self, TaskKind::Generate | TaskKind::Infill { .. })
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            TaskKind::Generate => "generate",
            TaskKind::Embed => "embed",
            TaskKind::Rerank => "rerank",
            TaskKind::Infill { .. } => "infill",
            TaskKind::SaveSlot { .. } => "save_slot",
            TaskKind::RestoreSlot { .. } => "restore_slot",
            TaskKind::EraseSlot { .. } => "erase_slot",
            TaskKind::Cancel { .. } => "cancel",
        }
    }
}

/// A unit of submitted work.
///
/// Construct with one of the helper constructors and adjust the public
/// fields; `id` and `arrival_seq` are assigned when the task is submitted.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub prompt: TokenSequence,
    pub sampling: SamplingParams,
    /// `None` generates until a stop condition or the context is exhausted.
    pub max_output_tokens: Option<usize>,
    pub stream: bool,
    /// Run on this slot only, waiting for it if it is busy.
    pub target_slot: Option<usize>,
    pub arrival_seq: u64,
}

impl Task {
    fn with_kind(kind: TaskKind, prompt: TokenSequence) -> Self {
        Self {
            id: 0,
            kind,
            prompt,
            sampling: SamplingParams::default(),
            max_output_tokens: None,
            stream: false,
            target_slot: None,
            arrival_seq: 0,
        }
    }

    pub fn generate(prompt: impl Into<TokenSequence>, max_output_tokens: usize) -> Self {
        let mut task = Self::with_kind(TaskKind::Generate, prompt.into());
        task.max_output_tokens = Some(max_output_tokens);
        task
    }

    pub fn embed(prompt: impl Into<TokenSequence>) -> Self {
        Self::with_kind(TaskKind::Embed, prompt.into())
    }

    pub fn rerank(prompt: impl Into<TokenSequence>) -> Self {
        Self::with_kind(TaskKind::Rerank, prompt.into())
    }

    pub fn infill(
        input_prefix: impl Into<TokenSequence>,
        input_suffix: impl Into<TokenSequence>,
        prompt: impl Into<TokenSequence>,
        max_output_tokens: usize,
    ) -> Self {
        let kind = TaskKind::Infill {
            input_prefix: input_prefix.into(),
            input_suffix: input_suffix.into(),
        };
        let mut task = Self::with_kind(kind, prompt.into());
        task.max_output_tokens = Some(max_output_tokens);
        task
    }

    pub fn save_slot(slot_id: usize, filename: impl Into<String>) -> Self {
        Self::with_kind(TaskKind::SaveSlot { slot_id, filename: filename.into() }, TokenSequence::new())
    }

    pub fn restore_slot(slot_id: usize, filename: impl Into<String>) -> Self {
        Self::with_kind(TaskKind::RestoreSlot { slot_id, filename: filename.into() }, TokenSequence::new())
    }

    pub fn erase_slot(slot_id: usize) -> Self {
        Self::with_kind(TaskKind::EraseSlot { slot_id }, TokenSequence::new())
    }

    pub fn cancel(target: TaskId) -> Self {
        Self::with_kind(TaskKind::Cancel { target }, TokenSequence::new())
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn on_slot(mut self, slot_id: usize) -> Self {
        self.target_slot = Some(slot_id);
        self
    }

    /// The slot an administrative task operates on.
    pub(crate) fn admin_slot(&self) -> Option<usize> {
        match &self.kind {
            TaskKind::SaveSlot { slot_id, .. }
            | TaskKind::RestoreSlot { slot_id, .. }
            | TaskKind::EraseSlot { slot_id } => Some(*slot_id),
            _ => None,
        }
    }
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The model produced its end-of-sequence token.
    Eos,
    /// `max_output_tokens` were generated.
    MaxTokens,
    /// A configured stop sequence was produced.
    StopSequence,
    /// The slot ran out of context positions.
    ContextExhausted,
}

/// Per-task timing and work counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timings {
    /// Prompt positions actually prefilled by the engine.
    pub n_prompt_processed: usize,
    /// Prompt positions reused from a resident cache or a checkpoint.
    pub n_cached: usize,
    pub n_generated: usize,
    pub prompt_ms: f64,
    pub generation_ms: f64,
}

/// The content of one [`TaskResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A streamed token at generation position `position` (0-based).
    Token { token: TokenId, position: usize },
    /// End of a generation. `tokens` holds the whole output for
    /// non-streamed tasks and is empty for streamed ones.
    Completion {
        tokens: Vec<TokenId>,
        stop_reason: StopReason,
        n_generated: usize,
    },
    Embedding(Vec<f32>),
    Rerank { score: f32 },
    SlotSaved { slot_id: usize, filename: String, n_saved: usize, n_bytes: usize },
    SlotRestored { slot_id: usize, filename: String, n_restored: usize },
    SlotErased { slot_id: usize, n_erased: usize },
    /// Reply to a cancel task. `found` is `false` when the target had
    /// already finished or never existed.
    CancelRequested { target: TaskId, found: bool },
    /// The task was cancelled before completing.
    Cancelled,
    Error(TaskError),
}

/// A unit of output produced for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub is_final: bool,
    pub payload: Payload,
    pub timings: Timings,
}

impl TaskResult {
    pub(crate) fn partial(task_id: TaskId, payload: Payload) -> Self {
        Self {
            task_id,
            is_final: false,
            payload,
            timings: Timings::default(),
        }
    }

    pub(crate) fn last(task_id: TaskId, payload: Payload, timings: Timings) -> Self {
        Self {
            task_id,
            is_final: true,
            payload,
            timings,
        }
    }

    pub(crate) fn error(task_id: TaskId, error: TaskError) -> Self {
        Self::last(task_id, Payload::Error(error), Timings::default())
    }

    pub(crate) fn cancelled(task_id: TaskId) -> Self {
        Self::last(task_id, Payload::Cancelled, Timings::default())
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, Payload::Error(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.payload, Payload::Cancelled)
    }
}
