//! Element-wise gated recurrence (HGRN).
//!
//! ```text
//! h_t = exp(g_t) ⊙ h_{t-1} + x_t        (state ∈ R^{dim})
//! ```
//!
//! Inputs are `(batch, seq, dim)`; each batch row is one lane, or with
//! packed offsets each segment of the single row is. The forget gate and
//! the scaled input are usually derived from raw projections with
//! [`forget_gate`] and [`gated_input`].

pub mod scan;

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, Zip};
use tracing::debug;

use crate::core::inputs::validate_offsets;
use crate::core::layout::{Lane, LaneLayout};
use crate::core::scan::ChunkPlan;
use crate::error::{Result, ScanError};
use crate::kernels::dispatch::{resolve_mode, Mode};
use crate::kernels::gating::{log_sigmoid, lower_bound_per_feature, swiglu_complement};
use crate::kernels::primitives::{lift_block, Accum, Precision};
use crate::runtime::config::EngineConfig;
use crate::runtime::health::{HealthReport, TensorHealth};

/// Result of [`forward`].
#[derive(Clone, Debug)]
pub struct HgrnOutput {
    /// `(batch, seq, dim)`.
    pub output: Array3<f32>,
    /// `(slots, dim)` when `return_final_state` is set.
    pub final_state: Option<Array2<f32>>,
    pub health: HealthReport,
}

/// Result of [`backward`].
#[derive(Clone, Debug)]
pub struct HgrnGradients {
    pub x: Array3<f32>,
    pub g: Array3<f32>,
    pub initial_state: Option<Array2<f32>>,
}

/// Log forget gate `ln σ(f)`.
///
/// With `bounds` (one per feature, or a single value) the decay is raised to
/// `lb + (1 − lb)·σ(f)` so it never falls below the feature's bound.
pub fn forget_gate(
    f_raw: ArrayView3<'_, f32>,
    bounds: Option<ArrayView1<'_, f32>>,
) -> Result<Array3<f32>> {
    let g = log_sigmoid(f_raw);
    match bounds {
        None => Ok(g),
        Some(lb) => lower_bound_per_feature(g.view(), lb).ok_or_else(|| {
            ScanError::shape(
                "lower_bound",
                format!("expected ({},) or (1,), got {:?}", g.dim().2, lb.dim()),
            )
        }),
    }
}

/// Recurrence input `silu(i) ⊙ (1 − exp(g))` with padded positions zeroed.
///
/// `mask` is `(batch, seq)`; `false` marks padding.
pub fn gated_input(
    i_raw: ArrayView3<'_, f32>,
    log_forget: ArrayView3<'_, f32>,
    mask: Option<ArrayView2<'_, bool>>,
) -> Result<Array3<f32>> {
    if i_raw.dim() != log_forget.dim() {
        return Err(ScanError::shape(
            "log_forget",
            format!("expected {:?}, got {:?}", i_raw.dim(), log_forget.dim()),
        ));
    }
    let mut x = swiglu_complement(i_raw, log_forget);
    if let Some(mask) = mask {
        let (batch, seq, _) = x.dim();
        if mask.dim() != (batch, seq) {
            return Err(ScanError::shape(
                "mask",
                format!("expected {:?}, got {:?}", (batch, seq), mask.dim()),
            ));
        }
        Zip::from(x.lanes_mut(Axis(2)))
            .and(&mask)
            .for_each(|mut row, &keep| {
                if !keep {
                    row.fill(0.0);
                }
            });
    }
    Ok(x)
}

/// Validate shapes and build the lanes: one per batch row, or one per
/// segment of `cu_seqlens`.
fn layout(
    x: ArrayView3<'_, f32>,
    g: ArrayView3<'_, f32>,
    initial: Option<ArrayView2<'_, f32>>,
    cu_seqlens: Option<&[usize]>,
) -> Result<LaneLayout> {
    if g.dim() != x.dim() {
        return Err(ScanError::shape(
            "g",
            format!("expected {:?}, got {:?}", x.dim(), g.dim()),
        ));
    }
    let (batch, seq, dim) = x.dim();
    let layout = match cu_seqlens {
        None => LaneLayout::dense(batch, seq, 1),
        Some(offsets) => {
            validate_offsets(offsets, batch, seq)?;
            LaneLayout::packed(offsets, 1)
        }
    };
    if let Some(h0) = initial {
        if h0.dim() != (layout.slots, dim) {
            return Err(ScanError::shape(
                "initial_state",
                format!("expected {:?}, got {:?}", (layout.slots, dim), h0.dim()),
            ));
        }
    }
    Ok(layout)
}

fn lane_block<A: Accum>(t: ArrayView3<'_, f32>, lane: &Lane) -> Array2<A> {
    lift_block(t.slice(s![lane.batch, lane.start..lane.end, ..]))
}

fn initial_row<A: Accum>(initial: Option<ArrayView2<'_, f32>>, slot: usize, dim: usize) -> Array1<A> {
    match initial {
        Some(h0) => h0.row(slot).mapv(A::lift),
        None => Array1::zeros(dim),
    }
}

/// Run the recurrence over every lane.
///
/// Packed `cu_seqlens` need `batch == 1` and run only in the recurrent
/// form; a call that resolves to `Mode::Chunk` is rejected.
pub fn forward(
    x: ArrayView3<'_, f32>,
    g: ArrayView3<'_, f32>,
    initial: Option<ArrayView2<'_, f32>>,
    cu_seqlens: Option<&[usize]>,
    config: &EngineConfig,
) -> Result<HgrnOutput> {
    config.validate()?;
    let layout = layout(x, g, initial, cu_seqlens)?;
    let (batch, seq, dim) = x.dim();
    let mode = resolve_mode(config.mode, layout.max_lane_len(), config.save_for_backward);
    if cu_seqlens.is_some() && mode == Mode::Chunk {
        return Err(ScanError::InvalidSegments(
            "packed sequences are only supported in fused_recurrent mode".to_string(),
        ));
    }
    debug!(
        batch,
        seq,
        dim,
        lanes = layout.len(),
        %mode,
        precision = %config.precision,
        "hgrn forward"
    );

    match config.precision {
        Precision::F32 => forward_with::<f32>(x, g, initial, &layout, config, mode),
        Precision::F64 => forward_with::<f64>(x, g, initial, &layout, config, mode),
    }
}

fn forward_with<A: Accum>(
    x: ArrayView3<'_, f32>,
    g: ArrayView3<'_, f32>,
    initial: Option<ArrayView2<'_, f32>>,
    layout: &LaneLayout,
    config: &EngineConfig,
    mode: Mode,
) -> Result<HgrnOutput> {
    let (batch, seq, dim) = x.dim();
    let plan = ChunkPlan::new(config.chunk_len)?;

    let lanes = config.execution.run(&layout.lanes, |lane| {
        let xb = lane_block::<A>(x, lane);
        let gb = lane_block::<A>(g, lane);
        let h0 = initial_row::<A>(initial, lane.slot, dim);
        match mode {
            Mode::FusedRecurrent => scan::recurrent_lane(xb.view(), gb.view(), h0),
            _ => scan::chunk_lane(xb.view(), gb.view(), h0, plan),
        }
    });

    let mut output = Array3::zeros((batch, seq, dim));
    let mut final_state = config
        .return_final_state
        .then(|| Array2::zeros((layout.slots, dim)));
    for (lane, (h, last)) in layout.lanes.iter().zip(lanes) {
        output
            .slice_mut(s![lane.batch, lane.start..lane.end, ..])
            .zip_mut_with(&h, |t, &v| *t = v.lower());
        if let Some(state) = final_state.as_mut() {
            state
                .row_mut(lane.slot)
                .zip_mut_with(&last, |t, &v| *t = v.lower());
        }
    }

    let mut tensors = vec![("output", TensorHealth::inspect(&output))];
    if let Some(state) = &final_state {
        tensors.push(("final_state", TensorHealth::inspect(state)));
    }
    let health = HealthReport::new(tensors);
    health.log("hgrn_forward");

    Ok(HgrnOutput {
        output,
        final_state,
        health,
    })
}

/// Gradients of a scalar loss given `∂loss/∂output` and optionally
/// `∂loss/∂final_state`. The forward states are recomputed chunk by chunk,
/// lane by lane, so packed offsets are accepted here in every mode.
pub fn backward(
    x: ArrayView3<'_, f32>,
    g: ArrayView3<'_, f32>,
    initial: Option<ArrayView2<'_, f32>>,
    cu_seqlens: Option<&[usize]>,
    grad_output: ArrayView3<'_, f32>,
    grad_final: Option<ArrayView2<'_, f32>>,
    config: &EngineConfig,
) -> Result<HgrnGradients> {
    config.validate()?;
    let layout = layout(x, g, initial, cu_seqlens)?;
    if grad_output.dim() != x.dim() {
        return Err(ScanError::shape(
            "grad_output",
            format!("expected {:?}, got {:?}", x.dim(), grad_output.dim()),
        ));
    }
    let dim = x.dim().2;
    if let Some(d) = grad_final {
        if d.dim() != (layout.slots, dim) {
            return Err(ScanError::shape(
                "grad_final_state",
                format!("expected {:?}, got {:?}", (layout.slots, dim), d.dim()),
            ));
        }
    }
    debug!(lanes = layout.len(), dim, precision = %config.precision, "hgrn backward");

    match config.precision {
        Precision::F32 => backward_with::<f32>(x, g, initial, &layout, grad_output, grad_final, config),
        Precision::F64 => backward_with::<f64>(x, g, initial, &layout, grad_output, grad_final, config),
    }
}

fn backward_with<A: Accum>(
    x: ArrayView3<'_, f32>,
    g: ArrayView3<'_, f32>,
    initial: Option<ArrayView2<'_, f32>>,
    layout: &LaneLayout,
    grad_output: ArrayView3<'_, f32>,
    grad_final: Option<ArrayView2<'_, f32>>,
    config: &EngineConfig,
) -> Result<HgrnGradients> {
    let (batch, seq, dim) = x.dim();
    let plan = ChunkPlan::new(config.chunk_len)?;

    let lanes = config.execution.run(&layout.lanes, |lane| {
        let xb = lane_block::<A>(x, lane);
        let gb = lane_block::<A>(g, lane);
        let gob = lane_block::<A>(grad_output, lane);
        let dfinal = grad_final.map(|d| d.row(lane.slot).mapv(A::lift));
        scan::backward_lane(
            xb.view(),
            gb.view(),
            initial_row::<A>(initial, lane.slot, dim),
            gob.view(),
            dfinal.as_ref().map(|d| d.view()),
            plan,
        )
    });

    let mut dx = Array3::zeros((batch, seq, dim));
    let mut dg = Array3::zeros((batch, seq, dim));
    let mut dh0 = Array2::zeros((layout.slots, dim));
    for (lane, grads) in layout.lanes.iter().zip(lanes) {
        let rows = s![lane.batch, lane.start..lane.end, ..];
        dx.slice_mut(rows).zip_mut_with(&grads.dx, |t, &v| *t = v.lower());
        dg.slice_mut(rows).zip_mut_with(&grads.dg, |t, &v| *t = v.lower());
        dh0.row_mut(lane.slot)
            .zip_mut_with(&grads.d_initial, |t, &v| *t = v.lower());
    }

    Ok(HgrnGradients {
        x: dx,
        g: dg,
        initial_state: initial.map(|_| dh0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::normal;
    use crate::grad::check::DirectionalCheck;
    use crate::kernels::dispatch::LaneExecution;
    use ndarray::{array, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn inputs(batch: usize, seq: usize, dim: usize, seed: u64) -> (Array3<f32>, Array3<f32>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let i_raw = normal((batch, seq, dim), 1.0, &mut rng);
        let f_raw = normal((batch, seq, dim), 1.0, &mut rng);
        let g = forget_gate(f_raw.view(), None).unwrap();
        let x = gated_input(i_raw.view(), g.view(), None).unwrap();
        (x, g)
    }

    fn max_abs_diff<D: ndarray::Dimension>(a: &ndarray::Array<f32, D>, b: &ndarray::Array<f32, D>) -> f32 {
        a.iter()
            .zip(b.iter())
            .fold(0.0_f32, |m, (x, y)| m.max((x - y).abs()))
    }

    #[test]
    fn test_forget_gate_respects_lower_bound() {
        let f = Array3::from_elem((1, 3, 2), -30.0_f32);
        let g = forget_gate(f.view(), Some(array![0.25_f32].view())).unwrap();
        assert!(g.iter().all(|&v| v.exp() >= 0.25 - 1e-6));
        let free = forget_gate(f.view(), None).unwrap();
        assert!(free.iter().all(|&v| v < -20.0));
    }

    #[test]
    fn test_forget_gate_per_feature_bounds() {
        let f = Array3::from_elem((2, 4, 3), -30.0_f32);
        let bounds = array![0.0_f32, 0.5, 0.9];
        let g = forget_gate(f.view(), Some(bounds.view())).unwrap();
        for lane in g.lanes(Axis(2)) {
            assert!(lane[0] < -20.0);
            assert!((lane[1].exp() - 0.5).abs() < 1e-5);
            assert!((lane[2].exp() - 0.9).abs() < 1e-5);
        }
        let wrong = array![0.1_f32, 0.2];
        assert!(matches!(
            forget_gate(f.view(), Some(wrong.view())),
            Err(ScanError::Shape { tensor: "lower_bound", .. })
        ));
    }

    #[test]
    fn test_gated_input_masks_padding() {
        let i = Array3::from_elem((2, 3, 2), 1.0_f32);
        let g = Array3::from_elem((2, 3, 2), -1.0_f32);
        let mask = Array2::from_shape_fn((2, 3), |(b, t)| !(b == 1 && t == 0));
        let x = gated_input(i.view(), g.view(), Some(mask.view())).unwrap();
        assert_eq!(x.slice(s![1, 0, ..]).sum(), 0.0);
        let expected = 1.0 / (1.0 + (-1.0_f32).exp()) * (1.0 - (-1.0_f32).exp());
        assert!((x[[0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_modes_agree() {
        let (x, g) = inputs(3, 40, 5, 1);
        let h0 = normal((3, 5), 1.0, &mut StdRng::seed_from_u64(2));
        let base = EngineConfig::default().with_chunk_len(8).with_final_state(true);
        let chunk = forward(
            x.view(),
            g.view(),
            Some(h0.view()),
            None,
            &base.clone().with_mode(Mode::Chunk),
        )
        .unwrap();
        let rec = forward(
            x.view(),
            g.view(),
            Some(h0.view()),
            None,
            &base.with_mode(Mode::FusedRecurrent).with_execution(LaneExecution::Sequential),
        )
        .unwrap();
        assert!(max_abs_diff(&chunk.output, &rec.output) < 1e-4);
        assert_eq!(chunk.final_state.unwrap().dim(), (3, 5));
        assert!(chunk.health.is_healthy());
    }

    #[test]
    fn test_shape_errors() {
        let (x, _) = inputs(1, 4, 2, 3);
        let g = Array3::<f32>::zeros((1, 4, 3));
        assert!(forward(x.view(), g.view(), None, None, &EngineConfig::default()).is_err());
        let g = Array3::<f32>::zeros((1, 4, 2));
        let h0 = Array2::<f32>::zeros((2, 2));
        assert!(forward(x.view(), g.view(), Some(h0.view()), None, &EngineConfig::default()).is_err());
    }

    #[test]
    fn test_packed_segments_equal_separate_calls() {
        let (x, g) = inputs(1, 12, 3, 20);
        let offsets = [0, 5, 5, 12];
        let h0 = normal((3, 3), 1.0, &mut StdRng::seed_from_u64(21));
        let cfg = EngineConfig::default()
            .with_final_state(true)
            .with_mode(Mode::FusedRecurrent)
            .with_precision(Precision::F64);
        let packed = forward(x.view(), g.view(), Some(h0.view()), Some(&offsets), &cfg).unwrap();
        let packed_state = packed.final_state.unwrap();
        assert_eq!(packed_state.dim(), (3, 3));

        let w = normal((1, 12, 3), 1.0, &mut StdRng::seed_from_u64(22));
        let grads = backward(x.view(), g.view(), Some(h0.view()), Some(&offsets), w.view(), None, &cfg).unwrap();
        let dh0 = grads.initial_state.unwrap();

        for (slot, seg) in offsets.windows(2).enumerate() {
            let r = seg[0]..seg[1];
            let xs = x.slice(s![.., r.clone(), ..]);
            let gs = g.slice(s![.., r.clone(), ..]);
            let hs = h0.slice(s![slot..slot + 1, ..]);
            let alone = forward(xs, gs, Some(hs), None, &cfg).unwrap();
            let part = packed.output.slice(s![.., r.clone(), ..]).to_owned();
            assert!(max_abs_diff(&part, &alone.output) < 1e-6, "slot {slot}");
            let state = packed_state.slice(s![slot..slot + 1, ..]).to_owned();
            assert!(max_abs_diff(&state, &alone.final_state.unwrap()) < 1e-6);

            let ws = w.slice(s![.., r.clone(), ..]);
            let single = backward(xs, gs, Some(hs), None, ws, None, &cfg).unwrap();
            let dx = grads.x.slice(s![.., r.clone(), ..]).to_owned();
            assert!(max_abs_diff(&dx, &single.x) < 1e-6);
            let dg = grads.g.slice(s![.., r, ..]).to_owned();
            assert!(max_abs_diff(&dg, &single.g) < 1e-6);
            let d0 = dh0.slice(s![slot..slot + 1, ..]).to_owned();
            assert!(max_abs_diff(&d0, &single.initial_state.unwrap()) < 1e-6);
        }
    }

    #[test]
    fn test_packed_segments_rejected_in_chunk_mode() {
        let (x, g) = inputs(1, 6, 2, 23);
        let offsets = [0, 2, 6];
        let chunk = EngineConfig::default().with_mode(Mode::Chunk);
        assert!(matches!(
            forward(x.view(), g.view(), None, Some(&offsets), &chunk),
            Err(ScanError::InvalidSegments(_))
        ));
        // Auto resolves to the chunk form whenever a gradient is needed.
        let training = EngineConfig::default().with_saved(true);
        assert!(matches!(
            forward(x.view(), g.view(), None, Some(&offsets), &training),
            Err(ScanError::InvalidSegments(_))
        ));
        let (x2, g2) = inputs(2, 6, 2, 24);
        assert!(matches!(
            forward(x2.view(), g2.view(), None, Some(&offsets), &EngineConfig::default()),
            Err(ScanError::InvalidSegments(_))
        ));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let (x, g) = inputs(2, 11, 3, 7);
        let mut rng = StdRng::seed_from_u64(8);
        let h0 = normal((2, 3), 1.0, &mut rng);
        let w = normal((2, 11, 3), 1.0, &mut rng);
        let ws = normal((2, 3), 1.0, &mut rng);
        let cfg = EngineConfig::default()
            .with_chunk_len(4)
            .with_final_state(true)
            .with_mode(Mode::Chunk)
            .with_precision(Precision::F64);

        let loss = |x: &Array3<f32>, g: &Array3<f32>, h0: &Array2<f32>| {
            let out = forward(x.view(), g.view(), Some(h0.view()), None, &cfg).unwrap();
            let a: f64 = out.output.iter().zip(w.iter()).map(|(&o, &c)| o as f64 * c as f64).sum();
            let fin = out.final_state.unwrap();
            let b: f64 = fin.iter().zip(ws.iter()).map(|(&o, &c)| o as f64 * c as f64).sum();
            a + b
        };
        let grads = backward(
            x.view(),
            g.view(),
            Some(h0.view()),
            None,
            w.view(),
            Some(ws.view()),
            &cfg,
        )
        .unwrap();

        let check = DirectionalCheck::default().with_epsilon(1e-3);
        let to64 = |a: &Array3<f32>| a.mapv(f64::from);
        let to32 = |a: &Array3<f64>| a.mapv(|v| v as f32);
        assert!(check.run(&to64(&x), to64(&grads.x).view(), |p| loss(&to32(p), &g, &h0)) < 1e-2);
        assert!(check.run(&to64(&g), to64(&grads.g).view(), |p| loss(&x, &to32(p), &h0)) < 1e-2);
        let dh0 = grads.initial_state.unwrap().mapv(f64::from);
        let err = check.run(&h0.mapv(f64::from), dh0.view(), |p| {
            loss(&x, &g, &p.mapv(|v| v as f32))
        });
        assert!(err < 1e-2);
    }
}
