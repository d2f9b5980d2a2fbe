//! # Token sequences
//!
//! A prompt or a response is an ordered run of [`Unit`]s: plain token ids or
//! opaque media chunks (an image or an audio clip already encoded by the
//! transport layer). A media chunk occupies `n_positions` positions in the KV
//! cache but is matched, batched and truncated as a single indivisible unit.
//!
//! Positions, not units, are the currency of the scheduler: `len()` is what a
//! slot's `n_past` counts, and prefix matching reports a position count.

use serde::{Deserialize, Serialize};

/// Vocabulary token id.
pub type TokenId = u32;

/// An opaque, pre-encoded media chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaChunk {
    /// Content hash supplied by the caller. Two chunks with the same id are
    /// treated as identical cache content.
    pub id: String,
    /// Number of cache positions the chunk occupies once decoded.
    pub n_positions: usize,
}

/// One element of a [`TokenSequence`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Token(TokenId),
    Media(MediaChunk),
}

impl Unit {
    /// Number of cache positions this unit occupies.
    pub fn n_positions(&self) -> usize {
        match self {
            Unit::Token(_) => 1,
            Unit::Media(chunk) => chunk.n_positions,
        }
    }
}

/// An ordered sequence of tokens and media chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSequence {
    units: Vec<Unit>,
    /// Cached total of `n_positions` over `units`.
    n_positions: usize,
}

impl TokenSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a text-only sequence.
    pub fn from_tokens(tokens: impl IntoIterator<Item = TokenId>) -> Self {
        let units: Vec<Unit> = tokens.into_iter().map(Unit::Token).collect();
        let n_positions = units.len();
        Self { units, n_positions }
    }

    /// Number of cache positions covered by the sequence.
    pub fn len(&self) -> usize {
        self.n_positions
    }

    pub fn is_empty(&self) -> bool {
        self.n_positions == 0
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn has_media(&self) -> bool {
        self.units.iter().any(|u| matches!(u, Unit::Media(_)))
    }

    /// The token ids of a text-only sequence, or `None` if it carries media.
    pub fn tokens(&self) -> Option<Vec<TokenId>> {
        self.units
            .iter()
            .map(|u| match u {
                Unit::Token(t) => Some(*t),
                Unit::Media(_) => None,
            })
            .collect()
    }

    /// The last unit, if it is a plain token.
    pub fn last_token(&self) -> Option<TokenId> {
        match self.units.last() {
            Some(Unit::Token(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn push_token(&mut self, token: TokenId) {
        self.units.push(Unit::Token(token));
        self.n_positions += 1;
    }

    pub fn push(&mut self, unit: Unit) {
        self.n_positions += unit.n_positions();
        self.units.push(unit);
    }

    pub fn extend(&mut self, other: &TokenSequence) {
        self.units.extend_from_slice(&other.units);
        self.n_positions += other.n_positions;
    }

    /// Number of leading positions shared with `other`.
    ///
    /// Tokens must be equal one for one; a media chunk counts only if both
    /// sides carry a chunk with the same id at the same place, and is never
    /// partially matched.
    pub fn common_prefix(&self, other: &TokenSequence) -> usize {
        let mut n = 0;
        for (a, b) in self.units.iter().zip(other.units.iter()) {
            if a != b {
                break;
            }
            n += a.n_positions();
        }
        n
    }

    /// `true` when every unit of `self` is matched by `other`.
    pub fn is_prefix_of(&self, other: &TokenSequence) -> bool {
        self.units.len() <= other.units.len() && self.common_prefix(other) == self.n_positions
    }

    /// Largest unit boundary that does not exceed `n_positions`.
    ///
    /// A truncation point that falls inside a media chunk is moved back to
    /// the start of that chunk.
    pub fn floor_boundary(&self, n_positions: usize) -> usize {
        let mut pos = 0;
        for unit in &self.units {
            let next = pos + unit.n_positions();
            if next > n_positions {
                break;
            }
            pos = next;
        }
        pos
    }

    /// Truncate to the first `n_positions` positions, rounded down to a unit
    /// boundary. Returns the resulting length.
    pub fn keep_first(&mut self, n_positions: usize) -> usize {
        let mut pos = 0;
        let mut keep = 0;
        for unit in &self.units {
            let next = pos + unit.n_positions();
            if next > n_positions {
                break;
            }
            pos = next;
            keep += 1;
        }
        self.units.truncate(keep);
        self.n_positions = pos;
        pos
    }

    /// Take the units starting at position `start` whose positions fit in
    /// `budget`. A media chunk larger than the whole budget is still
    /// returned when it is the first unit, so oversized chunks make progress.
    ///
    /// `start` must lie on a unit boundary.
    pub fn chunk_from(&self, start: usize, budget: usize) -> TokenSequence {
        let mut chunk = TokenSequence::new();
        let mut pos = 0;
        for unit in &self.units {
            if pos < start {
                pos += unit.n_positions();
                continue;
            }
            let n = unit.n_positions();
            if chunk.len() + n > budget && !chunk.is_empty() {
                break;
            }
            chunk.push(unit.clone());
            if chunk.len() >= budget {
                break;
            }
        }
        chunk
    }

    /// Check every token id against the vocabulary size.
    pub fn validate(&self, n_vocab: usize) -> Result<(), String> {
        for (i, unit) in self.units.iter().enumerate() {
            match unit {
                Unit::Token(t) if (*t as usize) >= n_vocab => {
                    return Err(format!("token {t} at index {i} is out of vocabulary range {n_vocab}"));
                }
                Unit::Media(chunk) if chunk.n_positions == 0 => {
                    return Err(format!("media chunk '{}' at index {i} covers no positions", chunk.id));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl From<Vec<TokenId>> for TokenSequence {
    fn from(tokens: Vec<TokenId>) -> Self {
        Self::from_tokens(tokens)
    }
}

impl FromIterator<Unit> for TokenSequence {
    fn from_iter<I: IntoIterator<Item = Unit>>(iter: I) -> Self {
        let mut seq = TokenSequence::new();
        for unit in iter {
            seq.push(unit);
        }
        seq
    }
}
