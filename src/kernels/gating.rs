//! Gate preprocessing on full tensors.
//!
//! Gates enter the engine in log space. These helpers turn raw
//! pre-activations into log-decays and are shape-agnostic.

use ndarray::{Array, ArrayView, ArrayView1, Dimension, Zip};

/// Numerically stable `ln σ(x)`.
#[inline]
pub fn log_sigmoid_scalar(x: f32) -> f32 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

/// `ln(eᵃ + eᵇ)` without overflow.
#[inline]
pub fn logaddexp_scalar(a: f32, b: f32) -> f32 {
    let hi = a.max(b);
    if hi == f32::NEG_INFINITY {
        return hi;
    }
    hi + ((a - hi).exp() + (b - hi).exp()).ln()
}

/// `x · σ(x)`.
#[inline]
pub fn silu_scalar(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Elementwise `ln σ(x)`; the result is always `≤ 0`.
pub fn log_sigmoid<D: Dimension>(x: ArrayView<f32, D>) -> Array<f32, D> {
    x.mapv(log_sigmoid_scalar)
}

/// Raise one log-decay so its decay factor never falls below `lb`.
///
/// `exp(out) = lb + (1 − lb)·exp(g)`, computed as
/// `logaddexp(ln lb, ln(1 − lb) + g)`. A bound of `0` is the identity.
#[inline]
pub fn lower_bound_scalar(g: f32, lb: f32) -> f32 {
    if lb <= 0.0 {
        return g;
    }
    logaddexp_scalar(lb.ln(), (-lb).ln_1p() + g)
}

/// [`lower_bound_scalar`] with one bound for the whole tensor.
pub fn lower_bound<D: Dimension>(log_decay: ArrayView<f32, D>, lower_bound: f32) -> Array<f32, D> {
    log_decay.mapv(|g| lower_bound_scalar(g, lower_bound))
}

/// [`lower_bound_scalar`] with one bound per feature, broadcast over the
/// trailing axis. `None` when `bounds` does not broadcast to `log_decay`.
pub fn lower_bound_per_feature<D: Dimension>(
    log_decay: ArrayView<f32, D>,
    bounds: ArrayView1<f32>,
) -> Option<Array<f32, D>> {
    let bounds = bounds.broadcast(log_decay.raw_dim())?;
    Some(
        Zip::from(&log_decay)
            .and(&bounds)
            .map_collect(|&g, &lb| lower_bound_scalar(g, lb)),
    )
}

/// `silu(x) ⊙ (1 − exp(g))`: the input of a forget-gated recurrence, scaled
/// so the state is a convex mix of history and input.
pub fn swiglu_complement<D: Dimension>(
    x: ArrayView<f32, D>,
    log_decay: ArrayView<f32, D>,
) -> Array<f32, D> {
    Zip::from(&x)
        .and(&log_decay)
        .map_collect(|&v, &g| silu_scalar(v) * (1.0 - g.exp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_log_sigmoid_matches_naive() {
        for &x in &[-8.0_f32, -1.0, 0.0, 0.5, 3.0] {
            let naive = (1.0 / (1.0 + (-x).exp())).ln();
            assert!((log_sigmoid_scalar(x) - naive).abs() < 1e-5, "x={x}");
        }
    }

    #[test]
    fn test_log_sigmoid_extreme_is_finite() {
        let out = log_sigmoid(array![-200.0_f32, 200.0].view());
        assert!(out.iter().all(|v| v.is_finite()));
        assert!((out[0] + 200.0).abs() < 1e-3);
        assert!(out[1].abs() < 1e-6);
    }

    #[test]
    fn test_lower_bound_floor() {
        let g = array![[-50.0_f32, -0.1]];
        let bounded = lower_bound(g.view(), 0.3);
        assert!((bounded[[0, 0]].exp() - 0.3).abs() < 1e-5);
        let expect = 0.3 + 0.7 * (-0.1_f32).exp();
        assert!((bounded[[0, 1]].exp() - expect).abs() < 1e-5);
    }

    #[test]
    fn test_lower_bound_zero_is_identity() {
        let g = array![-1.0_f32, -2.0];
        assert_eq!(lower_bound(g.view(), 0.0), g);
    }

    #[test]
    fn test_lower_bound_per_feature_broadcasts_over_last_axis() {
        let g = array![[-50.0_f32, -50.0, -0.5], [-50.0, -50.0, -0.5]];
        let bounds = array![0.0_f32, 0.5, 0.2];
        let out = lower_bound_per_feature(g.view(), bounds.view()).unwrap();
        for row in out.rows() {
            assert_eq!(row[0], -50.0);
            assert!((row[1].exp() - 0.5).abs() < 1e-5);
            let expect = 0.2 + 0.8 * (-0.5_f32).exp();
            assert!((row[2].exp() - expect).abs() < 1e-5);
        }
        assert!(lower_bound_per_feature(g.view(), array![0.1_f32, 0.2].view()).is_none());
    }

    #[test]
    fn test_swiglu_complement_vanishes_without_forgetting() {
        let x = array![1.0_f32, -2.0];
        let g = array![0.0_f32, 0.0];
        let out = swiglu_complement(x.view(), g.view());
        assert!(out.iter().all(|v| v.abs() < 1e-7));
    }
}
