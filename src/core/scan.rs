//! Chunked scan over one lane.
//!
//! For every chunk in position order: intra-chunk product, inter-chunk read
//! of the carried state, then the state advance. The state entering a chunk
//! is optionally snapshotted for the backward pass.

use std::ops::Range;

use ndarray::{s, Array2};

use crate::core::lane::LaneInputs;
use crate::error::{Result, ScanError};
use crate::grad::checkpoint::CheckpointStrategy;
use crate::kernels::intra_chunk::solve_intra_chunk;
use crate::kernels::primitives::Accum;
use crate::kernels::state_carry::StateCarry;

/// Fixed chunk partitioning of a lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_len: usize,
}

impl ChunkPlan {
    pub fn new(chunk_len: usize) -> Result<Self> {
        if chunk_len == 0 {
            return Err(ScanError::InvalidChunkLength(0));
        }
        Ok(Self { chunk_len })
    }

    /// Number of chunks covering `len` positions; the last may be short.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_len)
    }

    /// Position range of chunk `idx`.
    pub fn range(&self, idx: usize, len: usize) -> Range<usize> {
        let start = idx * self.chunk_len;
        start..(start + self.chunk_len).min(len)
    }

    pub fn chunks(&self, len: usize) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.chunk_count(len)).map(move |idx| self.range(idx, len))
    }
}

/// Forward result of one lane.
#[derive(Clone, Debug)]
pub struct LaneForward<A> {
    /// `[len, dv]`.
    pub output: Array2<A>,
    /// `[dk, dv]`.
    pub final_state: Array2<A>,
    /// Kept chunk-entry states, in chunk order.
    pub checkpoints: Vec<Array2<f64>>,
}

/// Run the chunked forward over one lane.
pub fn scan_lane<A: Accum>(
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

    for (idx, range) in plan.chunks(len).enumerate() {
        if keep.is_some_and(|k| k.keeps(idx)) {
            checkpoints.push(carry.state().mapv(A::lower64));
        }
        let q = lane.q.slice(s![range.clone(), ..]);
        let k = lane.k.slice(s![range.clone(), ..]);
        let v = lane.v.slice(s![range.clone(), ..]);
        let decay = lane.chunk_decay(range.clone());
        let decay = decay.as_ref().map(|b| b.view());

        let intra = solve_intra_chunk(q, k, v, decay, scale);
        let inter = carry.inter_chunk(q, decay, scale);
        output.slice_mut(s![range, ..]).assign(&(intra.output + inter));

        carry.advance(k, v, decay);
    }

    LaneForward {
        output,
        final_state: carry.into_state(),
        checkpoints,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inputs::AttentionInputs;
    use crate::core::layout::Lane;
    use crate::core::recurrent::recurrent_lane;
    use crate::fixtures::RandomInputs;

    fn lane_of(len: usize) -> Lane {
        Lane {
            batch: 0,
            head: 0,
            start: 0,
            end: len,
            slot: 0,
        }
    }

    fn max_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
        a.iter()
            .zip(b.iter())
            .fold(0.0, |m, (x, y)| m.max((x - y).abs()))
    }

    #[test]
    fn test_plan_ranges() {
        let plan = ChunkPlan::new(4).unwrap();
        let ranges: Vec<_> = plan.chunks(10).collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
        assert_eq!(plan.chunks(0).count(), 0);
        assert!(ChunkPlan::new(0).is_err());
    }

    #[test]
    fn test_chunked_matches_recurrent() {
        let data = RandomInputs::new(1, 37, 1, 5, 3).gated(true).seed(11).build();
        let inputs = data.as_inputs();
        let lane = LaneInputs::<f64>::gather(&inputs, &lane_of(37));
        let init = Array2::zeros((5, 3));
        let reference = recurrent_lane(&lane, init.clone(), ChunkPlan::new(8).unwrap(), 0.4, None);
        for chunk_len in [1, 3, 8, 16, 37, 64] {
            let out = scan_lane(&lane, init.clone(), ChunkPlan::new(chunk_len).unwrap(), 0.4, None);
            assert!(max_diff(&out.output, &reference.output) < 1e-10, "L={chunk_len}");
            assert!(max_diff(&out.final_state, &reference.final_state) < 1e-10);
        }
    }

    #[test]
    fn test_state_continuity() {
        // Running the two halves with the carried state equals one pass.
        let data = RandomInputs::new(1, 20, 1, 4, 4).gated(true).seed(3).build();
        let inputs: AttentionInputs<'_> = data.as_inputs();
        let plan = ChunkPlan::new(6).unwrap();
        let whole = LaneInputs::<f64>::gather(&inputs, &lane_of(20));
        let full = scan_lane(&whole, Array2::zeros((4, 4)), plan, 0.5, None);

        let first = LaneInputs::<f64>::gather(&inputs, &Lane { end: 9, ..lane_of(20) });
        let second = LaneInputs::<f64>::gather(&inputs, &Lane { start: 9, ..lane_of(20) });
        let a = scan_lane(&first, Array2::zeros((4, 4)), plan, 0.5, None);
        let b = scan_lane(&second, a.final_state.clone(), plan, 0.5, None);

        assert!(max_diff(&b.final_state, &full.final_state) < 1e-10);
        let tail = full.output.slice(s![9.., ..]).to_owned();
        assert!(max_diff(&b.output, &tail) < 1e-10);
    }

    #[test]
    fn test_zero_length_lane_returns_initial_state() {
        let data = RandomInputs::new(1, 0, 1, 2, 3).build();
        let inputs = data.as_inputs();
        let lane = LaneInputs::<f32>::gather(&inputs, &lane_of(0));
        let init = Array2::from_elem((2, 3), 0.25_f32);
        let out = scan_lane(&lane, init.clone(), ChunkPlan::new(4).unwrap(), 1.0, Some(CheckpointStrategy::StoreAll));
        assert_eq!(out.output.dim(), (0, 3));
        assert_eq!(out.final_state, init);
        assert!(out.checkpoints.is_empty());
    }

    #[test]
    fn test_checkpoints_recorded() {
        let data = RandomInputs::new(1, 10, 1, 2, 2).seed(5).build();
        let inputs = data.as_inputs();
        let lane = LaneInputs::<f32>::gather(&inputs, &lane_of(10));
        let plan = ChunkPlan::new(3).unwrap();
        let all = scan_lane(&lane, Array2::zeros((2, 2)), plan, 1.0, Some(CheckpointStrategy::StoreAll));
        assert_eq!(all.checkpoints.len(), 4);
        assert!(all.checkpoints[0].iter().all(|&x| x == 0.0));
        let sparse = scan_lane(&lane, Array2::zeros((2, 2)), plan, 1.0, Some(CheckpointStrategy::Every(2)));
        assert_eq!(sparse.checkpoints.len(), 2);
        assert_eq!(sparse.checkpoints[1], all.checkpoints[2]);
    }
}
