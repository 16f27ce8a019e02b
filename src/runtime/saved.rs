//! Forward intermediates kept for the backward pass.

use ndarray::{Array2, Array4};

use crate::core::inputs::{AttentionInputs, Dims};
use crate::grad::checkpoint::CheckpointStrategy;
use crate::kernels::dispatch::Mode;
use crate::kernels::primitives::Precision;

/// Everything backward needs: owned copies of the inputs and the kept
/// chunk-entry states of every lane.
///
/// States are stored in `f64` whatever the accumulation precision, so
/// recomputation from a kept state is exact in both precisions.
#[derive(Clone, Debug)]
pub struct SavedContext {
    pub(crate) query: Array4<f32>,
    pub(crate) key: Array4<f32>,
    pub(crate) value: Array4<f32>,
    pub(crate) gates: Option<Array4<f32>>,
    pub(crate) initial_state: Option<Array4<f32>>,
    pub(crate) padding_mask: Option<Array2<bool>>,
    pub(crate) cu_seqlens: Option<Vec<usize>>,
    pub(crate) dims: Dims,
    pub(crate) chunk_len: usize,
    pub(crate) scale: f64,
    pub(crate) precision: Precision,
    pub(crate) mode: Mode,
    pub(crate) strategy: CheckpointStrategy,
    /// Per lane, in layout order.
    pub(crate) checkpoints: Vec<Vec<Array2<f64>>>,
}

impl SavedContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn capture(
        inputs: &AttentionInputs<'_>,
        dims: Dims,
        chunk_len: usize,
        scale: f64,
        precision: Precision,
        mode: Mode,
        strategy: CheckpointStrategy,
        checkpoints: Vec<Vec<Array2<f64>>>,
    ) -> Self {
        Self {
            query: inputs.query.to_owned(),
            key: inputs.key.to_owned(),
            value: inputs.value.to_owned(),
            gates: inputs.gates.map(|g| g.to_owned()),
            initial_state: inputs.initial_state.map(|s| s.to_owned()),
            padding_mask: inputs.padding_mask.map(|m| m.to_owned()),
            cu_seqlens: inputs.cu_seqlens.map(<[usize]>::to_vec),
            dims,
            chunk_len,
            scale,
            precision,
            mode,
            strategy,
            checkpoints,
        }
    }

    /// Borrow the saved tensors as call inputs.
    pub fn inputs(&self) -> AttentionInputs<'_> {
        AttentionInputs {
            query: self.query.view(),
            key: self.key.view(),
            value: self.value.view(),
            gates: self.gates.as_ref().map(|g| g.view()),
            initial_state: self.initial_state.as_ref().map(|s| s.view()),
            padding_mask: self.padding_mask.as_ref().map(|m| m.view()),
            cu_seqlens: self.cu_seqlens.as_deref(),
        }
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    pub fn strategy(&self) -> CheckpointStrategy {
        self.strategy
    }

    /// Mode the forward pass ran in.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Number of kept states over all lanes.
    pub fn kept_states(&self) -> usize {
        self.checkpoints.iter().map(Vec::len).sum()
    }

    /// Approximate memory held by the kept states.
    pub fn state_bytes(&self) -> usize {
        self.kept_states() * self.dims.dk * self.dims.dv * std::mem::size_of::<f64>()
    }
}
