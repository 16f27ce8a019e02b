//! Intra-chunk attention: the causal contribution of positions inside one
//! chunk, evaluated as a dense lower-triangular product.

use ndarray::{Array2, ArrayView2};

use super::primitives::{causal_scores, Accum};

/// Result of solving one chunk.
#[derive(Clone, Debug)]
pub struct IntraChunk<A> {
    /// Lower-triangular `L × L` scores (scale and decay applied).
    pub scores: Array2<A>,
    /// `L × dv` intra-chunk output.
    pub output: Array2<A>,
}

/// Solve one chunk.
///
/// `q`, `k`: `[L, dk]`; `v`: `[L, dv]`; `decay`: cumulative log-decay
/// `[L, dk]` or `None` when ungated. An empty chunk gives empty results.
pub fn solve_intra_chunk<A: Accum>(
    q: ArrayView2<A>,
    k: ArrayView2<A>,
    v: ArrayView2<A>,
    decay: Option<ArrayView2<A>>,
    scale: A,
) -> IntraChunk<A> {
    let len = q.nrows();
    if len == 0 {
        return IntraChunk {
            scores: Array2::zeros((0, 0)),
            output: Array2::zeros((0, v.ncols())),
        };
    }
    let scores = causal_scores(q, k, decay, scale);
    let output = scores.dot(&v);
    IntraChunk { scores, output }
}
