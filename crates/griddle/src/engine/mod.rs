//! # Inference engine contract
//!
//! The scheduler never touches tensors. Everything below the batch boundary
//! belongs to an [`Engine`] implementation: it owns the model weights and the
//! shared KV cache, partitioned by [`SequenceId`], and turns one [`Batch`]
//! into one output per batch entry.
//!
//! ## Assumptions
//!
//! - Every [`BatchEntry`] targets a distinct sequence within one batch.
//! - `BatchEntry::pos` is the number of positions already resident for that
//!   sequence; the engine appends `units` after them.
//! - State blobs are opaque to the scheduler and only ever handed back to
//!   the engine that produced them.

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use crate::error::EngineError;
use crate::tokens::{TokenId, TokenSequence};

/// KV cache partition key. One per slot.
pub type SequenceId = usize;

/// What the scheduler needs back for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Intermediate prefill chunk; nothing to read back.
    None,
    /// Next-token logits for the last position of the entry.
    Logits,
    /// Pooled embedding over the whole sequence.
    Embedding,
}

/// One slot's contribution to a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub seq: SequenceId,
    /// First position written by this entry.
    pub pos: usize,
    pub units: TokenSequence,
    pub output: OutputKind,
}

/// The work submitted in a single engine invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: BatchEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total positions across all entries.
    pub fn n_positions(&self) -> usize {
        self.entries.iter().map(|e| e.units.len()).sum()
    }

    /// A batch holding only `entry`, used to isolate a failing contribution.
    pub(crate) fn single(entry: BatchEntry) -> Self {
        Self { entries: vec![entry] }
    }
}

/// Per-entry engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotOutput {
    Nothing,
    Logits(Vec<f32>),
    Embedding(Vec<f32>),
}

/// Output of a single invocation, aligned with `Batch::entries`.
pub type DecodeOutput = Vec<Result<SlotOutput, EngineError>>;

/// Serialized state of one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBlob(pub Vec<u8>);

impl StateBlob {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Vocabulary tokens with special meaning to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub eos: Option<TokenId>,
    pub fim_prefix: Option<TokenId>,
    pub fim_suffix: Option<TokenId>,
    pub fim_middle: Option<TokenId>,
}

/// # Engine
///
/// The opaque inference backend driven by the scheduler.
///
/// The scheduler holds the engine exclusively and calls it from a single
/// task, so implementations need no internal locking.
///
/// ## Failure model
///
/// `decode` may fail per entry (the inner `Result`) or as a whole (the outer
/// one). A whole-batch failure must leave every sequence unchanged; the
/// scheduler then retries each entry on its own to find the culprit. A
/// failed entry may leave its own sequence in any state: the scheduler
/// truncates it to zero afterwards.
#[async_trait]
pub trait Engine: Send + 'static {
    /// Vocabulary size; token ids must be below it.
    fn n_vocab(&self) -> usize;

    fn special_tokens(&self) -> SpecialTokens;

    /// Run one forward pass over `batch`.
    async fn decode(&mut self, batch: &Batch) -> Result<DecodeOutput, EngineError>;

    /// Snapshot the state of `seq`.
    fn save_state(&mut self, seq: SequenceId) -> Result<StateBlob, EngineError>;

    /// Replace the state of `seq` with `blob`.
    fn restore_state(&mut self, seq: SequenceId, blob: &StateBlob) -> Result<(), EngineError>;

    /// Keep the first `keep` positions of `seq`, dropping the rest.
    fn truncate(&mut self, seq: SequenceId, keep: usize) -> Result<(), EngineError>;
}
