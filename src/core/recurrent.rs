//! Position-by-position recurrence over one lane.
//!
//! Serves both as the `FusedRecurrent` evaluation mode and as the reference
//! the chunked scan is tested against. Chunk-entry states are snapshotted at
//! the same boundaries the chunked scan uses, so either mode can feed the
//! backward pass.

use ndarray::{s, Array2};

use crate::core::lane::LaneInputs;
use crate::core::scan::{ChunkPlan, LaneForward};
use crate::grad::checkpoint::CheckpointStrategy;
use crate::kernels::primitives::Accum;
use crate::kernels::state_carry::StateCarry;

pub fn recurrent_lane<A: Accum>(
    lane: &LaneInputs<A>,
    initial: Array2<A>,
    plan: ChunkPlan,
    scale: A,
    keep: Option<CheckpointStrategy>,
) -> LaneForward<A> {
    let len = lane.len();
    let mut output = Array2::zeros((len, lane.dv()));
    let mut carry = StateCarry::from_state(initial);
    let mut checkpoints = Vec::new();

    for t in 0..len {
        if t % plan.chunk_len == 0 && keep.is_some_and(|k| k.keeps(t / plan.chunk_len)) {
            checkpoints.push(carry.state().mapv(A::lower64));
        }
        let k = lane.k.slice(s![t..t + 1, ..]);
        let v = lane.v.slice(s![t..t + 1, ..]);
        let g = lane.g.as_ref().map(|g| g.slice(s![t..t + 1, ..]));
        carry.step(k, v, g);

        let q = lane.q.slice(s![t..t + 1, ..]);
        let o = carry.inter_chunk(q, None, scale);
        output.row_mut(t).assign(&o.row(0));
    }

    LaneForward {
        output,
        final_state: carry.into_state(),
        checkpoints,
    }
}
