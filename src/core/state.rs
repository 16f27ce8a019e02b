//! Persistable recurrent state.
//!
//! One `dk × dv` matrix per (slot, head), the summary of every position
//! processed so far. Threading it into the next call continues the sequence
//! exactly.

use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// Recurrent state of all lanes, `(slots, heads, dk, dv)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecurrentState {
    pub matrix: Array4<f32>,

    /// Number of positions folded into this state.
    pub tokens_seen: u64,
}

impl RecurrentState {
    /// Zero state.
    pub fn zeros(slots: usize, heads: usize, dk: usize, dv: usize) -> Self {
        Self {
            matrix: Array4::zeros((slots, heads, dk, dv)),
            tokens_seen: 0,
        }
    }

    pub fn from_matrix(matrix: Array4<f32>, tokens_seen: u64) -> Self {
        Self {
            matrix,
            tokens_seen,
        }
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.matrix.view()
    }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        self.matrix.dim()
    }

    /// Replace the state after `tokens` more positions.
    pub fn advance(&mut self, next: Array4<f32>, tokens: usize) -> Result<()> {
        if next.dim() != self.matrix.dim() {
            return Err(ScanError::shape(
                "state",
                format!("expected {:?}, got {:?}", self.matrix.dim(), next.dim()),
            ));
        }
        self.matrix = next;
        self.tokens_seen += tokens as u64;
        Ok(())
    }

    /// Reset state to zeros.
    pub fn reset(&mut self) {
        self.matrix.fill(0.0);
        self.tokens_seen = 0;
    }

    /// Check if the state has diverged (NaN or Inf).
    pub fn is_healthy(&self) -> bool {
        self.matrix.iter().all(|v| v.is_finite())
    }

    /// Frobenius norm over all lanes.
    pub fn norm(&self) -> f32 {
        self.matrix.mapv(|v| v * v).sum().sqrt()
    }

    /// Serialise state to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialise state from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Memory footprint in bytes.
    pub fn size_bytes(&self) -> usize {
        self.matrix.len() * std::mem::size_of::<f32>() + std::mem::size_of::<u64>()
    }
}
