use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use griddle::engine::{Batch, DecodeOutput, OutputKind, SequenceId, SlotOutput, SpecialTokens, StateBlob};
use griddle::{Engine, EngineError, TokenId, Unit};

/// Bytes, then the special tokens.
pub const EOS: TokenId = 256;
pub const FIM_PREFIX: TokenId = 257;
pub const FIM_SUFFIX: TokenId = 258;
pub const FIM_MIDDLE: TokenId = 259;
const VOCAB: usize = 260;

/// A byte-level toy model with a single induction head.
///
/// The next token is whatever followed the most recent earlier occurrence of
/// the current last token, so repeated phrases in a prompt get continued.
/// With no earlier occurrence it emits EOS.
pub struct EchoModel {
    caches: HashMap<SequenceId, Vec<Unit>>,
    step_delay: Duration,
}

impl EchoModel {
    pub fn new() -> Self {
        Self {
            caches: HashMap::new(),
            step_delay: Duration::from_millis(3),
        }
    }

    fn predict(context: &[Unit]) -> TokenId {
        let tokens: Vec<TokenId> = context
            .iter()
            .filter_map(|u| match u {
                Unit::Token(t) => Some(*t),
                Unit::Media(_) => None,
            })
            .collect();
        let Some((&last, earlier)) = tokens.split_last() else {
            return EOS;
        };
        earlier
            .iter()
            .rposition(|t| *t == last)
            .map(|i| tokens[i + 1])
            .unwrap_or(EOS)
    }

    fn logits(token: TokenId) -> Vec<f32> {
        let mut logits = vec![0.0; VOCAB];
        logits[token as usize] = 6.0;
        // Some mass on neighbouring bytes so sampling with temperature drifts.
        if token < 255 {
            logits[token as usize + 1] = 3.0;
        }
        if token > 0 && token < 256 {
            logits[token as usize - 1] = 3.0;
        }
        logits
    }

    fn embedding(context: &[Unit]) -> Vec<f32> {
        let mut histogram = vec![0.0f32; 16];
        for unit in context {
            if let Unit::Token(t) = unit {
                histogram[(*t % 16) as usize] += 1.0;
            }
        }
        let norm = histogram.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
        histogram.iter().map(|v| v / norm).collect()
    }
}

#[async_trait]
impl Engine for EchoModel {
    fn n_vocab(&self) -> usize {
        VOCAB
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            eos: Some(EOS),
            fim_prefix: Some(FIM_PREFIX),
            fim_suffix: Some(FIM_SUFFIX),
            fim_middle: Some(FIM_MIDDLE),
        }
    }

    async fn decode(&mut self, batch: &Batch) -> Result<DecodeOutput, EngineError> {
        tokio::time::sleep(self.step_delay).await;

        let mut outputs = Vec::with_capacity(batch.len());
        for entry in &batch.entries {
            let cache = self.caches.entry(entry.seq).or_default();
            let resident: usize = cache.iter().map(Unit::n_positions).sum();
            if resident != entry.pos {
                outputs.push(Err(EngineError::Decode(format!(
                    "sequence {} holds {resident} positions, entry starts at {}",
                    entry.seq, entry.pos
                ))));
                continue;
            }
            cache.extend(entry.units.units().iter().cloned());
            outputs.push(Ok(match entry.output {
                OutputKind::None => SlotOutput::Nothing,
                OutputKind::Logits => SlotOutput::Logits(Self::logits(Self::predict(cache))),
                OutputKind::Embedding => SlotOutput::Embedding(Self::embedding(cache)),
            }));
        }
        Ok(outputs)
    }

    fn save_state(&mut self, seq: SequenceId) -> Result<StateBlob, EngineError> {
        let cache = self.caches.get(&seq).ok_or(EngineError::MissingState(seq))?;
        serde_json::to_vec(cache)
            .map(StateBlob)
            .map_err(|e| EngineError::Other(e.to_string()))
    }

    fn restore_state(&mut self, seq: SequenceId, blob: &StateBlob) -> Result<(), EngineError> {
        let cache: Vec<Unit> = serde_json::from_slice(&blob.0).map_err(|e| EngineError::InvalidState(e.to_string()))?;
        self.caches.insert(seq, cache);
        Ok(())
    }

    fn truncate(&mut self, seq: SequenceId, keep: usize) -> Result<(), EngineError> {
        let cache = self.caches.entry(seq).or_default();
        let mut pos = 0;
        let n_units = cache
            .iter()
            .take_while(|u| {
                pos += u.n_positions();
                pos <= keep
            })
            .count();
        cache.truncate(n_units);
        Ok(())
    }
}
