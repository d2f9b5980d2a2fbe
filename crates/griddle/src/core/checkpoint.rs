//! Prompt checkpoints: engine state snapshots keyed by their token prefix.

use tracing::debug;
use uuid::Uuid;
use crate::engine::StateBlob;
use crate::tokens::TokenSequence;

/// A retained engine state snapshot.
pub(crate) struct Checkpoint {
    pub id: Uuid,
    /// Slot whose cache was saved.
    pub origin_slot: usize,
    /// Exactly the positions captured in `blob`.
    pub prefix: TokenSequence,
    pub blob: StateBlob,
    pub last_used: u64,
}

/// # CheckpointStore
///
/// A byte-budgeted pool of [`Checkpoint`]s with least-recently-used eviction.
///
/// A checkpoint is only ever reused for a prompt that it is an exact prefix
/// of; among several such checkpoints the longest one wins.
pub(crate) struct CheckpointStore {
    entries: Vec<Checkpoint>,
    budget_bytes: usize,
    max_entries: usize,
    total_bytes: usize,
}

impl CheckpointStore {
    pub fn new(budget_bytes: usize, max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            budget_bytes,
            max_entries,
            total_bytes: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.budget_bytes > 0 && self.max_entries > 0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Longest checkpoint whose prefix is an exact prefix of `prompt`.
    /// Returns its index and length.
    pub fn best_match(&self, prompt: &TokenSequence) -> Option<(usize, usize)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, cp)| !cp.prefix.is_empty() && cp.prefix.is_prefix_of(prompt))
            .max_by_key(|(_, cp)| (cp.prefix.len(), cp.last_used))
            .map(|(i, cp)| (i, cp.prefix.len()))
    }

    /// Borrow a checkpoint and mark it used.
    pub fn use_entry(&mut self, index: usize, tick: u64) -> &Checkpoint {
        let cp = &mut self.entries[index];
        cp.last_used = tick;
        cp
    }

    /// `true` if an existing checkpoint already covers `prefix` exactly.
    pub fn contains(&self, prefix: &TokenSequence) -> bool {
        self.entries.iter().any(|cp| &cp.prefix == prefix)
    }

    /// Retain a new checkpoint.
    ///
    /// Afterwards the least recently used entries are evicted until the pool
    /// fits its budget and entry limit. A blob larger than the whole budget
    /// is refused. Returns `false` if the checkpoint was not retained.
    pub fn insert(&mut self, origin_slot: usize, prefix: TokenSequence, blob: StateBlob, tick: u64) -> bool {
        if !self.is_enabled() || blob.len() > self.budget_bytes {
            return false;
        }

        self.total_bytes += blob.len();
        self.entries.push(Checkpoint {
            id: Uuid::new_v4(),
            origin_slot,
            prefix,
            blob,
            last_used: tick,
        });
        self.evict_to_budget();
        true
    }

    /// Drop the least recently used checkpoint.
    pub fn evict_lru(&mut self) -> Option<Checkpoint> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, cp)| cp.last_used)
            .map(|(i, _)| i)?;
        let cp = self.entries.swap_remove(index);
        self.total_bytes -= cp.blob.len();
        debug!(checkpoint = %cp.id, n_positions = cp.prefix.len(), "evicted checkpoint");
        Some(cp)
    }

    fn evict_to_budget(&mut self) {
        while self.total_bytes > self.budget_bytes || self.entries.len() > self.max_entries {
            if self.evict_lru().is_none() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(tokens: &[u32]) -> TokenSequence {
        TokenSequence::from_tokens(tokens.iter().copied())
    }

    fn blob(n: usize) -> StateBlob {
        StateBlob(vec![0; n])
    }

    #[test]
    fn test_longest_exact_prefix_wins() {
        let mut store = CheckpointStore::new(1000, 8);
        store.insert(0, seq(&[1, 2]), blob(10), 1);
        store.insert(1, seq(&[5, 6, 7]), blob(10), 2);
        store.insert(2, seq(&[1, 2, 3, 9]), blob(10), 3);

        // [1, 2, 3, 9] is not a prefix of the prompt, so [1, 2] wins.
        let prompt = seq(&[1, 2, 3, 4]);
        assert_eq!(store.best_match(&prompt), Some((0, 2)));

        assert_eq!(store.best_match(&seq(&[8])), None);
    }

    #[test]
    fn test_shorter_prefix_survives_extension_under_budget() {
        let mut store = CheckpointStore::new(1000, 8);
        store.insert(0, seq(&[1, 2]), blob(10), 1);
        store.insert(0, seq(&[1, 2, 3]), blob(20), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.total_bytes(), 30);

        // A prompt that diverges after the shared part still reuses it.
        assert_eq!(store.best_match(&seq(&[1, 2, 7])), Some((0, 2)));
        assert_eq!(store.best_match(&seq(&[1, 2, 3, 4])), Some((1, 3)));
    }

    #[test]
    fn test_lru_eviction_by_budget() {
        let mut store = CheckpointStore::new(25, 8);
        store.insert(0, seq(&[1]), blob(10), 1);
        store.insert(1, seq(&[2]), blob(10), 2);
        // Touch the first so the second becomes least recently used.
        store.use_entry(0, 3);
        store.insert(2, seq(&[3]), blob(10), 4);

        assert_eq!(store.len(), 2);
        assert!(store.contains(&seq(&[1])));
        assert!(!store.contains(&seq(&[2])));
        assert!(store.total_bytes() <= 25);
    }

    #[test]
    fn test_count_limit_and_oversized_blob() {
        let mut store = CheckpointStore::new(100, 1);
        assert!(store.insert(0, seq(&[1]), blob(10), 1));
        assert!(store.insert(0, seq(&[2]), blob(10), 2));
        assert_eq!(store.len(), 1);
        assert!(!store.insert(0, seq(&[3]), blob(101), 3));

        let disabled = CheckpointStore::new(0, 8);
        assert!(!disabled.is_enabled());
    }
}
