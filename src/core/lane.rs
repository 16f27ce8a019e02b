//! Per-lane views of the input tensors, lifted to the accumulation type.

use std::ops::Range;

use ndarray::{s, Array2, Array4, ArrayView2, ArrayView4};

use crate::core::inputs::AttentionInputs;
use crate::core::layout::Lane;
use crate::kernels::primitives::{cumsum_rows, expand_gate, lift_block, Accum};

/// One lane's inputs as owned `[positions, features]` blocks.
#[derive(Clone, Debug)]
pub struct LaneInputs<A> {
    pub q: Array2<A>,
    /// Keys with padded positions zeroed.
    pub k: Array2<A>,
    pub v: Array2<A>,
    /// Per-position log-decay broadcast to `dk`.
    pub g: Option<Array2<A>>,
    /// `false` rows were padding.
    pub key_mask: Option<Vec<bool>>,
}

impl<A: Accum> LaneInputs<A> {
    /// Gather the lane's rows. Inputs must already be validated.
    pub fn gather(inputs: &AttentionInputs<'_>, lane: &Lane) -> Self {
        let rows = lane.start..lane.end;
        let q = lift_block(lane_rows(inputs.query, lane, rows.clone()));
        let mut k = lift_block(lane_rows(inputs.key, lane, rows.clone()));
        let v = lift_block(lane_rows(inputs.value, lane, rows.clone()));
        let dk = q.ncols();
        let g = inputs
            .gates
            .map(|g| expand_gate(lift_block::<A>(lane_rows(g, lane, rows.clone())).view(), dk));

        let key_mask = inputs.padding_mask.map(|m| {
            m.slice(s![lane.batch, rows.clone()])
                .iter()
                .copied()
                .collect::<Vec<bool>>()
        });
        if let Some(mask) = &key_mask {
            for (mut row, &keep) in k.rows_mut().into_iter().zip(mask.iter()) {
                if !keep {
                    row.fill(A::zero());
                }
            }
        }

        Self {
            q,
            k,
            v,
            g,
            key_mask,
        }
    }

    pub fn len(&self) -> usize {
        self.q.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.q.nrows() == 0
    }

    pub fn dk(&self) -> usize {
        self.q.ncols()
    }

    pub fn dv(&self) -> usize {
        self.v.ncols()
    }

    /// Cumulative log-decay of the rows in `range`, restarted at the chunk
    /// boundary.
    pub fn chunk_decay(&self, range: Range<usize>) -> Option<Array2<A>> {
        self.g
            .as_ref()
            .map(|g| cumsum_rows(g.slice(s![range, ..])))
    }

    /// Zero gradient rows of padded keys.
    pub fn mask_key_grad(&self, grad: &mut Array2<A>) {
        if let Some(mask) = &self.key_mask {
            for (mut row, &keep) in grad.rows_mut().into_iter().zip(mask.iter()) {
                if !keep {
                    row.fill(A::zero());
                }
            }
        }
    }
}

/// `[positions, features]` view of one lane.
pub fn lane_rows<'a>(
    tensor: ArrayView4<'a, f32>,
    lane: &Lane,
    rows: Range<usize>,
) -> ArrayView2<'a, f32> {
    tensor.slice_move(s![lane.batch, rows, lane.head, ..])
}

/// The lane's `[dk, dv]` block of a state tensor.
pub fn lane_state<A: Accum>(state: ArrayView4<'_, f32>, lane: &Lane) -> Array2<A> {
    lift_block(state.slice(s![lane.slot, lane.head, .., ..]))
}

/// Write a lane's rows back into a `(batch, position, head, feature)` tensor.
pub fn scatter_rows<A: Accum>(target: &mut Array4<f32>, lane: &Lane, block: ArrayView2<'_, A>) {
    target
        .slice_mut(s![lane.batch, lane.start..lane.end, lane.head, ..])
        .zip_mut_with(&block, |t, &v| *t = v.lower());
}

/// Write a lane's `[dk, dv]` block into a `(slots, heads, dk, dv)` tensor.
pub fn scatter_state<A: Accum>(target: &mut Array4<f32>, lane: &Lane, block: ArrayView2<'_, A>) {
    target
        .slice_mut(s![lane.slot, lane.head, .., ..])
        .zip_mut_with(&block, |t, &v| *t = v.lower());
}
