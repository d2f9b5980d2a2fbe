use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use crate::engine::{Batch, DecodeOutput, Engine, OutputKind, SequenceId, SlotOutput, SpecialTokens, StateBlob};
use crate::error::EngineError;
use crate::tokens::{TokenId, Unit};

pub(crate) const MOCK_VOCAB: usize = 1000;
pub(crate) const MOCK_EOS: TokenId = 999;

/// Counters observable from tests after the engine moved into a scheduler.
#[derive(Debug, Default)]
pub(crate) struct MockStats {
    pub decode_calls: AtomicUsize,
    pub positions: AtomicUsize,
    pub max_entries: AtomicUsize,
    pub restores: AtomicUsize,
}

impl MockStats {
    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub fn positions(&self) -> usize {
        self.positions.load(Ordering::SeqCst)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

// A deterministic stand-in for a model.
//
// Every sequence's cache is a plain list of units. The greedy next token is a
// pure function of the cached context, so continuing from a restored cache
// yields exactly what continuing from the original would have.
pub(crate) struct MockEngine {
    caches: HashMap<SequenceId, Vec<Unit>>,
    stats: Arc<MockStats>,
    delay: Option<Duration>,
    /// Entries containing this token fail.
    poison: Option<TokenId>,
    /// When set, a poisoned entry fails the whole invocation instead.
    poison_fails_batch: bool,
    /// Entries containing this token make `decode` panic.
    panic_on: Option<TokenId>,
    /// A context ending in this token makes the model emit EOS.
    eos_trigger: Option<TokenId>,
    with_fim: bool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            caches: HashMap::new(),
            stats: Arc::new(MockStats::default()),
            delay: None,
            poison: None,
            poison_fails_batch: false,
            panic_on: None,
            eos_trigger: None,
            with_fim: true,
        }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_poison(mut self, token: TokenId, fails_batch: bool) -> Self {
        self.poison = Some(token);
        self.poison_fails_batch = fails_batch;
        self
    }

    pub fn with_panic(mut self, token: TokenId) -> Self {
        self.panic_on = Some(token);
        self
    }

    pub fn with_eos_trigger(mut self, token: TokenId) -> Self {
        self.eos_trigger = Some(token);
        self
    }

    pub fn without_fim(mut self) -> Self {
        self.with_fim = false;
        self
    }

    /// The token greedy decoding picks after `context`.
    pub fn next_token(context: &[Unit], eos_trigger: Option<TokenId>) -> TokenId {
        let last = match context.last() {
            Some(Unit::Token(t)) => *t,
            Some(Unit::Media(m)) => m.n_positions as TokenId,
            None => 0,
        };
        if eos_trigger == Some(last) {
            return MOCK_EOS;
        }
        let n_positions: usize = context.iter().map(Unit::n_positions).sum();
        ((last as usize * 31 + n_positions * 7 + 1) % (MOCK_VOCAB - 1)) as TokenId
    }

    fn logits_for(token: TokenId) -> Vec<f32> {
        let mut logits = vec![0.0; MOCK_VOCAB];
        logits[token as usize] = 10.0;
        logits
    }

    fn embedding_for(context: &[Unit]) -> Vec<f32> {
        let tokens: Vec<f32> = context
            .iter()
            .filter_map(|u| match u {
                Unit::Token(t) => Some(*t as f32),
                Unit::Media(_) => None,
            })
            .collect();
        let mean = if tokens.is_empty() { 0.0 } else { tokens.iter().sum::<f32>() / tokens.len() as f32 };
        vec![mean, context.len() as f32]
    }

    fn is_poisoned(&self, units: &[Unit]) -> bool {
        match self.poison {
            Some(p) => units.iter().any(|u| *u == Unit::Token(p)),
            None => false,
        }
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn n_vocab(&self) -> usize {
        MOCK_VOCAB
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            eos: Some(MOCK_EOS),
            fim_prefix: self.with_fim.then_some(990),
            fim_suffix: self.with_fim.then_some(991),
            fim_middle: self.with_fim.then_some(992),
        }
    }

    async fn decode(&mut self, batch: &Batch) -> Result<DecodeOutput, EngineError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.stats.decode_calls.fetch_add(1, Ordering::SeqCst);
        self.stats.positions.fetch_add(batch.n_positions(), Ordering::SeqCst);
        self.stats.max_entries.fetch_max(batch.len(), Ordering::SeqCst);

        if let Some(token) = self.panic_on {
            if batch.entries.iter().any(|e| e.units.units().contains(&Unit::Token(token))) {
                panic!("mock engine hit token {token}");
            }
        }

        if self.poison_fails_batch && batch.entries.iter().any(|e| self.is_poisoned(e.units.units())) {
            return Err(EngineError::Decode("poisoned batch".into()));
        }

        let mut outputs = Vec::with_capacity(batch.len());
        for entry in &batch.entries {
            if self.is_poisoned(entry.units.units()) {
                outputs.push(Err(EngineError::Decode(format!("poisoned entry for sequence {}", entry.seq))));
                continue;
            }
            let cache = self.caches.entry(entry.seq).or_default();
            let resident: usize = cache.iter().map(Unit::n_positions).sum();
            if resident != entry.pos {
                outputs.push(Err(EngineError::Decode(format!(
                    "sequence {} has {resident} resident positions, entry starts at {}",
                    entry.seq, entry.pos
                ))));
                continue;
            }
            cache.extend(entry.units.units().iter().cloned());
            let output = match entry.output {
                OutputKind::None => SlotOutput::Nothing,
                OutputKind::Logits => SlotOutput::Logits(Self::logits_for(Self::next_token(cache, self.eos_trigger))),
                OutputKind::Embedding => SlotOutput::Embedding(Self::embedding_for(cache)),
            };
            outputs.push(Ok(output));
        }
        Ok(outputs)
    }

    fn save_state(&mut self, seq: SequenceId) -> Result<StateBlob, EngineError> {
        let cache = self.caches.get(&seq).ok_or(EngineError::MissingState(seq))?;
        let bytes = serde_json::to_vec(cache).map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(StateBlob(bytes))
    }

    fn restore_state(&mut self, seq: SequenceId, blob: &StateBlob) -> Result<(), EngineError> {
        let cache: Vec<Unit> = serde_json::from_slice(&blob.0)
            .map_err(|e| EngineError::InvalidState(e.to_string()))?;
        self.stats.restores.fetch_add(1, Ordering::SeqCst);
        self.caches.insert(seq, cache);
        Ok(())
    }

    fn truncate(&mut self, seq: SequenceId, keep: usize) -> Result<(), EngineError> {
        let cache = self.caches.entry(seq).or_default();
        let mut pos = 0;
        let mut n_units = 0;
        for unit in cache.iter() {
            if pos + unit.n_positions() > keep {
                break;
            }
            pos += unit.n_positions();
            n_units += 1;
        }
        cache.truncate(n_units);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BatchEntry;
    use crate::tokens::TokenSequence;

    fn entry(seq: SequenceId, pos: usize, tokens: &[TokenId], output: OutputKind) -> BatchEntry {
        BatchEntry { seq, pos, units: TokenSequence::from_tokens(tokens.iter().copied()), output }
    }

    #[tokio::test]
    async fn test_mock_rejects_position_mismatch() {
        let mut engine = MockEngine::new();
        let mut batch = Batch::new();
        batch.push(entry(0, 3, &[1, 2], OutputKind::Logits));
        let out = engine.decode(&batch).await.unwrap();
        assert!(out[0].is_err());
    }

    #[tokio::test]
    async fn test_mock_save_restore_roundtrip() {
        let mut engine = MockEngine::new();
        let mut batch = Batch::new();
        batch.push(entry(0, 0, &[5, 6, 7], OutputKind::Logits));
        engine.decode(&batch).await.unwrap();

        let blob = engine.save_state(0).unwrap();
        engine.restore_state(1, &blob).unwrap();
        assert_eq!(engine.caches.get(&0), engine.caches.get(&1));

        engine.truncate(1, 1).unwrap();
        assert_eq!(engine.caches.get(&1).map(Vec::len), Some(1));
    }
}
