//! Chunk-local numeric primitives.
//!
//! Everything here is a pure function over `[positions, features]` blocks
//! small enough to materialise densely. Functions are generic over the
//! accumulation type so the same code runs in `f32` or `f64`.

use ndarray::{Array2, ArrayView2, Axis, NdFloat, Zip};
use serde::{Deserialize, Serialize};

/// Accumulation type used inside the engine.
///
/// Inputs and outputs are always `f32`; `lift`/`lower` convert at the lane
/// boundary.
pub trait Accum: NdFloat {
    /// Short name for logs.
    const NAME: &'static str;

    fn lift(v: f32) -> Self;
    fn lower(self) -> f32;
    fn lift64(v: f64) -> Self;
    fn lower64(self) -> f64;
}

impl Accum for f32 {
    const NAME: &'static str = "f32";

    #[inline]
    fn lift(v: f32) -> Self {
        v
    }
    #[inline]
    fn lower(self) -> f32 {
        self
    }
    #[inline]
    fn lift64(v: f64) -> Self {
        v as f32
    }
    #[inline]
    fn lower64(self) -> f64 {
        self as f64
    }
}

impl Accum for f64 {
    const NAME: &'static str = "f64";

    #[inline]
    fn lift(v: f32) -> Self {
        v as f64
    }
    #[inline]
    fn lower(self) -> f32 {
        self as f32
    }
    #[inline]
    fn lift64(v: f64) -> Self {
        v
    }
    #[inline]
    fn lower64(self) -> f64 {
        self
    }
}

/// Accumulation precision selected at run time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Accumulate in `f32`.
    #[default]
    F32,
    /// Accumulate in `f64`; slower, but drift over long sequences vanishes.
    F64,
}

impl Precision {
    /// Documented relative tolerance against an `f64` reference.
    pub fn tolerance(self) -> f64 {
        match self {
            Precision::F32 => crate::config::F32_TOLERANCE,
            Precision::F64 => crate::config::F64_TOLERANCE,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::F32 => write!(f, "f32"),
            Precision::F64 => write!(f, "f64"),
        }
    }
}

/// Convert an `f32` block into the accumulation type.
pub fn lift_block<A: Accum>(x: ArrayView2<f32>) -> Array2<A> {
    x.mapv(A::lift)
}

// ──────────────────────────────────────────────────────────────
// Cumulative operations along the position axis
// ──────────────────────────────────────────────────────────────

/// Inclusive prefix sum over rows: `out[i] = Σ_{m ≤ i} x[m]`.
pub fn cumsum_rows<A: Accum>(x: ArrayView2<A>) -> Array2<A> {
    let mut out = x.to_owned();
    if out.nrows() > 1 {
        out.accumulate_axis_inplace(Axis(0), |&prev, cur| *cur += prev);
    }
    out
}

/// Inclusive suffix sum over rows: `out[i] = Σ_{m ≥ i} x[m]`.
pub fn reverse_cumsum_rows<A: Accum>(x: ArrayView2<A>) -> Array2<A> {
    let mut out = x.to_owned();
    let rows = out.nrows();
    for i in (0..rows.saturating_sub(1)).rev() {
        for c in 0..out.ncols() {
            let next = out[[i + 1, c]];
            out[[i, c]] += next;
        }
    }
    out
}

/// Inclusive prefix product over rows.
pub fn cumprod_rows<A: Accum>(x: ArrayView2<A>) -> Array2<A> {
    let mut out = x.to_owned();
    if out.nrows() > 1 {
        out.accumulate_axis_inplace(Axis(0), |&prev, cur| *cur *= prev);
    }
    out
}

// ──────────────────────────────────────────────────────────────
// Gating
// ──────────────────────────────────────────────────────────────

/// `x ⊙ exp(b)` for matching `[positions, features]` blocks.
pub fn gate_rows<A: Accum>(x: ArrayView2<A>, log_decay: ArrayView2<A>) -> Array2<A> {
    Zip::from(&x)
        .and(&log_decay)
        .map_collect(|&v, &b| v * b.exp())
}

/// Rows of `x` decayed to the end of the block: `x_j ⊙ exp(b_last − b_j)`.
pub fn gate_rows_to_end<A: Accum>(x: ArrayView2<A>, log_decay: ArrayView2<A>) -> Array2<A> {
    let rows = x.nrows();
    if rows == 0 {
        return x.to_owned();
    }
    let last = log_decay.row(rows - 1);
    let mut out = x.to_owned();
    for (j, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
        for (d, v) in row.iter_mut().enumerate() {
            *v = *v * (last[d] - log_decay[[j, d]]).exp();
        }
    }
    out
}

// ──────────────────────────────────────────────────────────────
// Causal scoring
// ──────────────────────────────────────────────────────────────

/// Zero every entry strictly above the diagonal.
pub fn causal_mask_inplace<A: Accum>(scores: &mut Array2<A>) {
    let cols = scores.ncols();
    for (i, mut row) in scores.axis_iter_mut(Axis(0)).enumerate() {
        for j in (i + 1)..cols {
            row[j] = A::zero();
        }
    }
}

/// Lower-triangular score matrix of one chunk.
///
/// `scores[i, j] = scale · Σ_d q[i,d] k[j,d] exp(b[i,d] − b[j,d])` for
/// `j ≤ i`, zero otherwise. Without a decay this is the masked `scale·QKᵀ`.
/// The decay difference is exponentiated per pair rather than factored as
/// `exp(b_i)·exp(−b_j)`, which would overflow for strong gates.
pub fn causal_scores<A: Accum>(
    q: ArrayView2<A>,
    k: ArrayView2<A>,
    decay: Option<ArrayView2<A>>,
    scale: A,
) -> Array2<A> {
    let len = q.nrows();
    match decay {
        None => {
            let mut scores = q.dot(&k.t()) * scale;
            causal_mask_inplace(&mut scores);
            scores
        }
        Some(b) => {
            let features = q.ncols();
            let mut scores = Array2::zeros((len, len));
            for i in 0..len {
                for j in 0..=i {
                    let mut acc = A::zero();
                    for d in 0..features {
                        acc += q[[i, d]] * k[[j, d]] * (b[[i, d]] - b[[j, d]]).exp();
                    }
                    scores[[i, j]] = acc * scale;
                }
            }
            scores
        }
    }
}

/// Broadcast a `[positions, 1]` gate block across `features` columns.
pub fn expand_gate<A: Accum>(gate: ArrayView2<A>, features: usize) -> Array2<A> {
    if gate.ncols() == features {
        return gate.to_owned();
    }
    Array2::from_shape_fn((gate.nrows(), features), |(t, _)| gate[[t, 0]])
}

/// Sum a `[positions, features]` gradient back onto a `[positions, 1]` gate.
pub fn reduce_gate<A: Accum>(grad: ArrayView2<A>) -> Array2<A> {
    grad.sum_axis(Axis(1)).insert_axis(Axis(1))
}
