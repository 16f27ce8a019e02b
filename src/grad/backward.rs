//! Reverse sweep over one lane.
//!
//! Chunks are visited last to first. Each chunk receives the gradient of
//! the state it produced (`dS`) and hands back the gradient of the state it
//! consumed, which becomes `dS` for the chunk before it. With sparse
//! checkpoints, the states of a segment are recomputed from its kept state
//! before the segment is swept.

use ndarray::{s, Array2, ArrayView2, Axis};

use crate::core::lane::LaneInputs;
use crate::core::scan::ChunkPlan;
use crate::error::{Result, ScanError};
use crate::grad::checkpoint::CheckpointStrategy;
use crate::kernels::primitives::{
    causal_mask_inplace, causal_scores, gate_rows, reverse_cumsum_rows, Accum,
};
use crate::kernels::state_carry::chunk_state_update;

/// Gradients of one chunk.
#[derive(Clone, Debug)]
pub struct ChunkGrads<A> {
    pub dq: Array2<A>,
    pub dk: Array2<A>,
    pub dv: Array2<A>,
    /// Gradient of the per-position log-decay, `[L, dk]`.
    pub dg: Option<Array2<A>>,
    /// Gradient of the state entering the chunk.
    pub ds_in: Array2<A>,
}

/// Backward of one chunk.
///
/// `decay` is the chunk's cumulative log-decay `b`; `ds` is the gradient of
/// the state leaving the chunk.
#[allow(clippy::too_many_arguments)]
pub fn chunk_backward<A: Accum>(
    q: ArrayView2<A>,
    k: ArrayView2<A>,
    v: ArrayView2<A>,
    decay: Option<ArrayView2<A>>,
    state_in: ArrayView2<A>,
    grad_out: ArrayView2<A>,
    ds: ArrayView2<A>,
    scale: A,
) -> ChunkGrads<A> {
    match decay {
        None => ungated_chunk_backward(q, k, v, state_in, grad_out, ds, scale),
        Some(b) => gated_chunk_backward(q, k, v, b, state_in, grad_out, ds, scale),
    }
}

fn ungated_chunk_backward<A: Accum>(
    q: ArrayView2<A>,
    k: ArrayView2<A>,
    v: ArrayView2<A>,
    state_in: ArrayView2<A>,
    grad_out: ArrayView2<A>,
    ds: ArrayView2<A>,
    scale: A,
) -> ChunkGrads<A> {
    let scores = causal_scores(q, k, None, scale);
    let mut dp = grad_out.dot(&v.t());
    causal_mask_inplace(&mut dp);

    let dq = (dp.dot(&k) + grad_out.dot(&state_in.t())) * scale;
    let dk = dp.t().dot(&q) * scale + v.dot(&ds.t());
    let dv = scores.t().dot(&grad_out) + k.dot(&ds);
    let ds_in = q.t().dot(&grad_out) * scale + ds;

    ChunkGrads {
        dq,
        dk,
        dv,
        dg: None,
        ds_in,
    }
}

#[allow(clippy::too_many_arguments)]
fn gated_chunk_backward<A: Accum>(
    q: ArrayView2<A>,
    k: ArrayView2<A>,
    v: ArrayView2<A>,
    b: ArrayView2<A>,
    state_in: ArrayView2<A>,
    grad_out: ArrayView2<A>,
    ds: ArrayView2<A>,
    scale: A,
) -> ChunkGrads<A> {
    let len = q.nrows();
    let dk_dim = q.ncols();
    if len == 0 {
        return ChunkGrads {
            dq: q.to_owned(),
            dk: k.to_owned(),
            dv: v.to_owned(),
            dg: Some(b.to_owned()),
            ds_in: ds.to_owned(),
        };
    }
    let last = len - 1;
    let b_last = b.row(last);

    let scores = causal_scores(q, k, Some(b), scale);
    let qs = q.mapv(|x| x * scale);
    let q_gate = gate_rows(qs.view(), b);
    let to_end = gate_decay_to_end(b);
    let kd = &k * &to_end;

    let dp = grad_out.dot(&v.t());
    let do_s = grad_out.dot(&state_in.t());
    let v_ds = v.dot(&ds.t());

    let dv = scores.t().dot(&grad_out) + kd.dot(&ds);

    // Inter-chunk and state-update terms.
    let mut dq = gate_rows(do_s.view(), b) * scale;
    let mut dk = &v_ds * &to_end;
    let mut db = &q_gate * &do_s;
    let u = &kd * &v_ds;
    db -= &u;
    {
        let mut last_row = db.row_mut(last);
        last_row += &u.sum_axis(Axis(0));
        for d in 0..dk_dim {
            let carried = state_in.row(d).dot(&ds.row(d));
            last_row[d] += b_last[d].exp() * carried;
        }
    }

    // Intra-chunk terms.
    for i in 0..len {
        for j in 0..=i {
            let dp_ij = dp[[i, j]];
            if dp_ij == A::zero() {
                continue;
            }
            for d in 0..dk_dim {
                let e = (b[[i, d]] - b[[j, d]]).exp();
                let t = dp_ij * qs[[i, d]] * k[[j, d]] * e;
                dq[[i, d]] += dp_ij * k[[j, d]] * e * scale;
                dk[[j, d]] += dp_ij * qs[[i, d]] * e;
                db[[i, d]] += t;
                db[[j, d]] -= t;
            }
        }
    }

    let mut ds_in = ds.to_owned();
    for (mut row, &bl) in ds_in.axis_iter_mut(Axis(0)).zip(b_last.iter()) {
        row *= bl.exp();
    }
    ds_in += &q_gate.t().dot(&grad_out);

    ChunkGrads {
        dq,
        dk,
        dv,
        dg: Some(reverse_cumsum_rows(db.view())),
        ds_in,
    }
}

/// `exp(b_last − b_j)` for every row.
fn gate_decay_to_end<A: Accum>(b: ArrayView2<A>) -> Array2<A> {
    let last = b.nrows().saturating_sub(1);
    let b_last = b.row(last);
    Array2::from_shape_fn(b.dim(), |(j, d)| (b_last[d] - b[[j, d]]).exp())
}

/// Gradients of one lane.
#[derive(Clone, Debug)]
pub struct LaneGrads<A> {
    pub dq: Array2<A>,
    pub dk: Array2<A>,
    pub dv: Array2<A>,
    /// `[len, dk]`; reduce over features for per-head gates.
    pub dg: Option<Array2<A>>,
    /// Gradient of the lane's initial state.
    pub d_initial: Array2<A>,
}

/// Backward over one lane from its kept chunk-entry states.
#[allow(clippy::too_many_arguments)]
pub fn backward_lane<A: Accum>(
    lane: &LaneInputs<A>,
    checkpoints: &[Array2<f64>],
    strategy: CheckpointStrategy,
    plan: ChunkPlan,
    scale: A,
    grad_output: ArrayView2<A>,
    grad_final: Option<ArrayView2<A>>,
) -> Result<LaneGrads<A>> {
    let len = lane.len();
    let (dk_dim, dv_dim) = (lane.dk(), lane.dv());
    let chunks = plan.chunk_count(len);
    if checkpoints.len() != strategy.kept_count(chunks) {
        return Err(ScanError::shape(
            "saved",
            format!(
                "expected {} kept states for {chunks} chunks, found {}",
                strategy.kept_count(chunks),
                checkpoints.len()
            ),
        ));
    }

    let mut ds = match grad_final {
        Some(g) => g.to_owned(),
        None => Array2::zeros((dk_dim, dv_dim)),
    };
    let mut dq = Array2::zeros((len, dk_dim));
    let mut dk = Array2::zeros((len, dk_dim));
    let mut dv = Array2::zeros((len, dv_dim));
    let mut dg = lane.g.as_ref().map(|_| Array2::zeros((len, dk_dim)));

    for (slot, first, end) in strategy.segments_reversed(chunks) {
        let mut states = Vec::with_capacity(end - first);
        states.push(checkpoints[slot].mapv(A::lift64));
        for c in first..end.saturating_sub(1) {
            let range = plan.range(c, len);
            let decay = lane.chunk_decay(range.clone());
            let prev = &states[states.len() - 1];
            let next = chunk_state_update(
                prev.view(),
                lane.k.slice(s![range.clone(), ..]),
                lane.v.slice(s![range, ..]),
                decay.as_ref().map(|b| b.view()),
            );
            states.push(next);
        }

        for c in (first..end).rev() {
            let range = plan.range(c, len);
            let decay = lane.chunk_decay(range.clone());
            let grads = chunk_backward(
                lane.q.slice(s![range.clone(), ..]),
                lane.k.slice(s![range.clone(), ..]),
                lane.v.slice(s![range.clone(), ..]),
                decay.as_ref().map(|b| b.view()),
                states[c - first].view(),
                grad_output.slice(s![range.clone(), ..]),
                ds.view(),
                scale,
            );
            dq.slice_mut(s![range.clone(), ..]).assign(&grads.dq);
            dk.slice_mut(s![range.clone(), ..]).assign(&grads.dk);
            dv.slice_mut(s![range.clone(), ..]).assign(&grads.dv);
            if let (Some(acc), Some(chunk_dg)) = (dg.as_mut(), grads.dg.as_ref()) {
                acc.slice_mut(s![range, ..]).assign(chunk_dg);
            }
            ds = grads.ds_in;
        }
    }

    lane.mask_key_grad(&mut dk);

    Ok(LaneGrads {
        dq,
        dk,
        dv,
        dg,
        d_initial: ds,
    })
}
