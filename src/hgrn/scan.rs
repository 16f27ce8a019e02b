//! Lane kernels of the element-wise recurrence `h_t = exp(g_t) ⊙ h_{t-1} + x_t`.
//!
//! Every feature is its own scalar recurrence, so a lane is one batch row
//! with a `[dim]` state.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::core::scan::ChunkPlan;
use crate::kernels::primitives::{cumsum_rows, Accum};

/// Chunked forward: `h_i = exp(b_i) ⊙ h_in + Σ_{j ≤ i} exp(b_i − b_j) ⊙ x_j`.
pub fn chunk_lane<A: Accum>(
    x: ArrayView2<A>,
    g: ArrayView2<A>,
    initial: Array1<A>,
    plan: ChunkPlan,
) -> (Array2<A>, Array1<A>) {
    let (len, dim) = x.dim();
    let mut out = Array2::zeros((len, dim));
    let mut state = initial;

    for range in plan.chunks(len) {
        let b = cumsum_rows(g.slice(s![range.clone(), ..]));
        let xc = x.slice(s![range.clone(), ..]);
        let mut block = out.slice_mut(s![range, ..]);
        for i in 0..b.nrows() {
            for d in 0..dim {
                let mut acc = b[[i, d]].exp() * state[d];
                for j in 0..=i {
                    acc += (b[[i, d]] - b[[j, d]]).exp() * xc[[j, d]];
                }
                block[[i, d]] = acc;
            }
        }
        if let Some(last) = block.axis_iter(Axis(0)).last() {
            state = last.to_owned();
        }
    }
    (out, state)
}

/// Position-by-position forward.
pub fn recurrent_lane<A: Accum>(
    x: ArrayView2<A>,
    g: ArrayView2<A>,
    initial: Array1<A>,
) -> (Array2<A>, Array1<A>) {
    let mut out = Array2::zeros(x.dim());
    let mut h = initial;
    for ((xt, gt), mut row) in x
        .axis_iter(Axis(0))
        .zip(g.axis_iter(Axis(0)))
        .zip(out.axis_iter_mut(Axis(0)))
    {
        h = &h * &gt.mapv(|v| v.exp()) + &xt;
        row.assign(&h);
    }
    (out, h)
}

/// Gradients of one lane.
#[derive(Clone, Debug)]
pub struct HgrnLaneGrads<A> {
    pub dx: Array2<A>,
    pub dg: Array2<A>,
    pub d_initial: Array1<A>,
}

/// Chunked backward.
///
/// Within a chunk `dh_i = Σ_{j ≥ i} exp(b_j − b_i) ⊙ dO_j + exp(b_last − b_i) ⊙ dH`,
/// then `dx = dh`, `dg = dh ⊙ (h − x)` and the state entering the chunk
/// receives `exp(g_first) ⊙ dh_first`.
pub fn backward_lane<A: Accum>(
    x: ArrayView2<A>,
    g: ArrayView2<A>,
    initial: Array1<A>,
    grad_out: ArrayView2<A>,
    grad_final: Option<ArrayView1<A>>,
    plan: ChunkPlan,
) -> HgrnLaneGrads<A> {
    let (len, dim) = x.dim();
    let (h, _) = chunk_lane(x, g, initial, plan);
    let mut dh_carry = match grad_final {
        Some(d) => d.to_owned(),
        None => Array1::zeros(dim),
    };
    let mut dx = Array2::zeros((len, dim));
    let mut dg = Array2::zeros((len, dim));

    let ranges: Vec<_> = plan.chunks(len).collect();
    for range in ranges.into_iter().rev() {
        let b = cumsum_rows(g.slice(s![range.clone(), ..]));
        let go = grad_out.slice(s![range.clone(), ..]);
        let rows = b.nrows();
        let last = rows - 1;
        let mut dh = Array2::zeros((rows, dim));
        for i in 0..rows {
            for d in 0..dim {
                let mut acc = (b[[last, d]] - b[[i, d]]).exp() * dh_carry[d];
                for j in i..rows {
                    acc += (b[[j, d]] - b[[i, d]]).exp() * go[[j, d]];
                }
                dh[[i, d]] = acc;
            }
        }

        let hc = h.slice(s![range.clone(), ..]);
        let xc = x.slice(s![range.clone(), ..]);
        dg.slice_mut(s![range.clone(), ..])
            .assign(&(&dh * &(&hc - &xc)));
        dh_carry = &dh.row(0) * &g.row(range.start).mapv(|v| v.exp());
        dx.slice_mut(s![range, ..]).assign(&dh);
    }

    HgrnLaneGrads {
        dx,
        dg,
        d_initial: dh_carry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grad::check::DirectionalCheck;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn block(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
        crate::fixtures::normal((rows, cols), 1.0, rng).mapv(f64::from)
    }

    #[test]
    fn test_recurrent_by_hand() {
        let x = array![[1.0_f64], [2.0], [3.0]];
        let g = array![[0.0_f64], [(0.5_f64).ln()], [(0.5_f64).ln()]];
        let (h, last) = recurrent_lane(x.view(), g.view(), array![4.0]);
        // 4 + 1 = 5; 2.5 + 2 = 4.5; 2.25 + 3 = 5.25
        assert!((h[[0, 0]] - 5.0).abs() < 1e-12);
        assert!((h[[1, 0]] - 4.5).abs() < 1e-12);
        assert!((last[0] - 5.25).abs() < 1e-12);
    }

    #[test]
    fn test_chunk_matches_recurrent() {
        let mut rng = StdRng::seed_from_u64(4);
        let x = block(19, 5, &mut rng);
        let g = block(19, 5, &mut rng).mapv(|z| -(z.abs() * 0.3));
        let h0 = Array1::from_elem(5, 0.3);
        let (reference, ref_last) = recurrent_lane(x.view(), g.view(), h0.clone());
        for chunk_len in [1, 4, 7, 19, 64] {
            let (h, last) = chunk_lane(x.view(), g.view(), h0.clone(), ChunkPlan::new(chunk_len).unwrap());
            for (a, b) in h.iter().zip(reference.iter()) {
                assert!((a - b).abs() < 1e-10, "L={chunk_len}");
            }
            for (a, b) in last.iter().zip(ref_last.iter()) {
                assert!((a - b).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_empty_lane_keeps_state() {
        let x = Array2::<f32>::zeros((0, 3));
        let h0 = array![1.0_f32, 2.0, 3.0];
        let (h, last) = chunk_lane(x.view(), x.view(), h0.clone(), ChunkPlan::new(4).unwrap());
        assert_eq!(h.dim(), (0, 3));
        assert_eq!(last, h0);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(12);
        let (len, dim) = (10, 3);
        let x = block(len, dim, &mut rng);
        let g = block(len, dim, &mut rng).mapv(|z| -(z.abs() * 0.4));
        let h0 = block(1, dim, &mut rng).row(0).to_owned();
        let w = block(len, dim, &mut rng);
        let ws = block(1, dim, &mut rng).row(0).to_owned();
        let plan = ChunkPlan::new(3).unwrap();

        let loss = |x: &Array2<f64>, g: &Array2<f64>, h0: &Array1<f64>| {
            let (h, last) = chunk_lane(x.view(), g.view(), h0.clone(), plan);
            (&h * &w).sum() + (&last * &ws).sum()
        };
        let grads = backward_lane(x.view(), g.view(), h0.clone(), w.view(), Some(ws.view()), plan);
        let check = DirectionalCheck::default();

        assert!(check.run(&x, grads.dx.view(), |p| loss(p, &g, &h0)) < 1e-6);
        assert!(check.run(&g, grads.dg.view(), |p| loss(&x, p, &h0)) < 1e-6);
        assert!(check.run(&h0, grads.d_initial.view(), |p| loss(&x, &g, p)) < 1e-6);
    }
}
