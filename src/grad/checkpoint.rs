//! Which chunk-entry states the forward pass keeps for backward.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// Chunk-entry state retention.
///
/// `StoreAll` keeps the state entering every chunk. `Every(n)` keeps chunks
/// `0, n, 2n, …` and backward recomputes the states in between, trading
/// `O(chunks / n)` memory for one extra state sweep per segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStrategy {
    #[default]
    StoreAll,
    Every(usize),
}

impl CheckpointStrategy {
    pub fn validate(self) -> Result<Self> {
        match self {
            CheckpointStrategy::Every(0) => Err(ScanError::InvalidCheckpointInterval),
            other => Ok(other),
        }
    }

    /// Spacing between kept states, in chunks.
    pub fn interval(self) -> usize {
        match self {
            CheckpointStrategy::StoreAll => 1,
            CheckpointStrategy::Every(n) => n.max(1),
        }
    }

    /// Whether the state entering chunk `chunk` is kept.
    pub fn keeps(self, chunk: usize) -> bool {
        chunk % self.interval() == 0
    }

    /// Number of states kept for a lane of `chunks` chunks.
    pub fn kept_count(self, chunks: usize) -> usize {
        chunks.div_ceil(self.interval())
    }

    /// Chunk ranges `[first, last)` that share one kept state, last first.
    pub fn segments_reversed(self, chunks: usize) -> impl Iterator<Item = (usize, usize, usize)> {
        let interval = self.interval();
        let count = self.kept_count(chunks);
        (0..count).rev().map(move |slot| {
            let first = slot * interval;
            (slot, first, (first + interval).min(chunks))
        })
    }
}

impl std::fmt::Display for CheckpointStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointStrategy::StoreAll => write!(f, "store_all"),
            CheckpointStrategy::Every(n) => write!(f, "every({n})"),
        }
    }
}
