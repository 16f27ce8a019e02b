//! Recurrent state carried across chunk boundaries.
//!
//! A lane's state `S ∈ R^{dk × dv}` summarises every position before the
//! current chunk. Each chunk reads it once (inter-chunk contribution) and
//! then replaces it (advance).

use ndarray::{Array2, ArrayView2, Axis};

use super::primitives::{gate_rows, gate_rows_to_end, Accum};

/// `k_j ⊙ exp(b_last − b_j)`, or `k` itself when ungated.
pub fn decayed_keys<A: Accum>(k: ArrayView2<A>, decay: Option<ArrayView2<A>>) -> Array2<A> {
    match decay {
        Some(b) => gate_rows_to_end(k, b),
        None => k.to_owned(),
    }
}

/// State after a chunk: `diag(exp(b_last)) S_in + Σ_j (k_j ⊙ exp(b_last − b_j)) v_jᵀ`.
pub fn chunk_state_update<A: Accum>(
    state_in: ArrayView2<A>,
    k: ArrayView2<A>,
    v: ArrayView2<A>,
    decay: Option<ArrayView2<A>>,
) -> Array2<A> {
    let len = k.nrows();
    if len == 0 {
        return state_in.to_owned();
    }
    let kd = decayed_keys(k, decay);
    let mut next = state_in.to_owned();
    if let Some(b) = decay {
        let last = b.row(len - 1);
        for (mut row, &bl) in next.axis_iter_mut(Axis(0)).zip(last.iter()) {
            row *= bl.exp();
        }
    }
    next + kd.t().dot(&v)
}

/// One lane's carried state.
#[derive(Clone, Debug)]
pub struct StateCarry<A> {
    state: Array2<A>,
}

impl<A: Accum> StateCarry<A> {
    /// Zero state of shape `[dk, dv]`.
    pub fn zeros(dk: usize, dv: usize) -> Self {
        Self {
            state: Array2::zeros((dk, dv)),
        }
    }

    pub fn from_state(state: Array2<A>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> ArrayView2<'_, A> {
        self.state.view()
    }

    pub fn into_state(self) -> Array2<A> {
        self.state
    }

    /// Contribution of everything before the chunk: `scale (q ⊙ exp(b)) S`.
    pub fn inter_chunk(&self, q: ArrayView2<A>, decay: Option<ArrayView2<A>>, scale: A) -> Array2<A> {
        let gated = match decay {
            Some(b) => gate_rows(q, b),
            None => q.to_owned(),
        };
        gated.dot(&self.state) * scale
    }

    /// Fold one chunk into the state. Uses the pre-chunk state throughout.
    pub fn advance(&mut self, k: ArrayView2<A>, v: ArrayView2<A>, decay: Option<ArrayView2<A>>) {
        self.state = chunk_state_update(self.state.view(), k, v, decay);
    }

    /// Single-position update `S ← diag(exp(g)) S + k vᵀ`.
    pub fn step(&mut self, k: ArrayView2<A>, v: ArrayView2<A>, log_decay: Option<ArrayView2<A>>) {
        debug_assert_eq!(k.nrows(), 1);
        self.advance(k, v, log_decay);
    }
}
