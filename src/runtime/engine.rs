//! The two external operations: chunked forward and its backward.

use ndarray::{Array2, Array4, ArrayView4};
use tracing::{debug, trace};

use crate::core::inputs::{AttentionInputs, Dims};
use crate::core::lane::{lane_rows, lane_state, scatter_rows, scatter_state, LaneInputs};
use crate::core::layout::{Lane, LaneLayout};
use crate::core::recurrent::recurrent_lane;
use crate::core::scan::{scan_lane, ChunkPlan, LaneForward};
use crate::error::{Result, ScanError};
use crate::grad::backward::{backward_lane, LaneGrads};
use crate::kernels::dispatch::{resolve_mode, ChunkCost, Mode};
use crate::kernels::primitives::{lift_block, reduce_gate, Accum, Precision};
use crate::runtime::config::EngineConfig;
use crate::runtime::health::{HealthReport, TensorHealth};
use crate::runtime::saved::SavedContext;

/// Result of [`ChunkedLinearAttention::forward`].
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    /// `(batch, position, head, dv)`.
    pub output: Array4<f32>,
    /// `(slots, heads, dk, dv)` when `return_final_state` is set.
    pub final_state: Option<Array4<f32>>,
    /// Present when `save_for_backward` is set.
    pub saved: Option<SavedContext>,
    pub health: HealthReport,
}

/// What backward should produce beyond the input gradients.
#[derive(Clone, Copy, Debug, Default)]
pub struct BackwardRequest<'a> {
    /// Return the gradient of the initial state.
    pub initial_state: bool,
    /// Gradient flowing into the final state from a later call.
    pub grad_final_state: Option<ArrayView4<'a, f32>>,
}

impl<'a> BackwardRequest<'a> {
    pub fn with_initial_state(mut self) -> Self {
        self.initial_state = true;
        self
    }

    pub fn with_grad_final_state(mut self, grad: ArrayView4<'a, f32>) -> Self {
        self.grad_final_state = Some(grad);
        self
    }
}

/// Result of [`ChunkedLinearAttention::backward`].
#[derive(Clone, Debug)]
pub struct Gradients {
    pub query: Array4<f32>,
    pub key: Array4<f32>,
    pub value: Array4<f32>,
    /// Same shape as the gates given to forward.
    pub gates: Option<Array4<f32>>,
    pub initial_state: Option<Array4<f32>>,
    pub health: HealthReport,
}

/// Chunked causal linear attention engine.
#[derive(Clone, Debug)]
pub struct ChunkedLinearAttention {
    config: EngineConfig,
}

impl ChunkedLinearAttention {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate the recurrence over every lane.
    pub fn forward(&self, inputs: &AttentionInputs<'_>) -> Result<ForwardOutput> {
        let dims = inputs.validate(self.config.use_gates)?;
        let layout = LaneLayout::new(&dims, inputs.cu_seqlens);
        let mode = resolve_mode(
            self.config.mode,
            layout.max_lane_len(),
            self.config.save_for_backward,
        );
        let scale = self.config.resolved_scale(dims.dk);
        let cost = match mode {
            Mode::FusedRecurrent => {
                ChunkCost::estimate_recurrent(layout.len(), layout.max_lane_len(), dims.dk, dims.dv)
            }
            _ => ChunkCost::estimate(
                layout.len(),
                layout.max_lane_len(),
                self.config.chunk_len,
                dims.dk,
                dims.dv,
                if self.config.save_for_backward {
                    self.config
                        .checkpoint
                        .kept_count(layout.max_lane_len().div_ceil(self.config.chunk_len))
                } else {
                    0
                },
            ),
        };
        debug!(
            batch = dims.batch,
            seq_len = dims.seq_len,
            heads = dims.heads,
            dk = dims.dk,
            dv = dims.dv,
            lanes = layout.len(),
            chunk_len = self.config.chunk_len,
            %mode,
            precision = %self.config.precision,
            execution = %self.config.execution,
            flops = cost.flops,
            saved_bytes = cost.saved_state_bytes * layout.len(),
            "chunked forward"
        );

        match self.config.precision {
            Precision::F32 => self.forward_with::<f32>(inputs, dims, &layout, mode, scale),
            Precision::F64 => self.forward_with::<f64>(inputs, dims, &layout, mode, scale),
        }
    }

    fn forward_with<A: Accum>(
        &self,
        inputs: &AttentionInputs<'_>,
        dims: Dims,
        layout: &LaneLayout,
        mode: Mode,
        scale: f64,
    ) -> Result<ForwardOutput> {
        let plan = ChunkPlan::new(self.config.chunk_len)?;
        let keep = self
            .config
            .save_for_backward
            .then_some(self.config.checkpoint);
        let scale_a = A::lift64(scale);

        let lanes: Vec<LaneForward<A>> = self.config.execution.run(&layout.lanes, |lane| {
            trace!(
                slot = lane.slot,
                head = lane.head,
                len = lane.len(),
                accum = A::NAME,
                "forward lane"
            );
            let gathered = LaneInputs::<A>::gather(inputs, lane);
            let initial = initial_lane_state(inputs, lane, &dims);
            match mode {
                Mode::FusedRecurrent => recurrent_lane(&gathered, initial, plan, scale_a, keep),
                _ => scan_lane(&gathered, initial, plan, scale_a, keep),
            }
        });

        let mut output = Array4::zeros((dims.batch, dims.seq_len, dims.heads, dims.dv));
        let mut final_state = self
            .config
            .return_final_state
            .then(|| Array4::zeros(dims.state_shape()));
        let mut checkpoints = Vec::with_capacity(lanes.len());
        for (lane, result) in layout.lanes.iter().zip(lanes) {
            scatter_rows(&mut output, lane, result.output.view());
            if let Some(state) = final_state.as_mut() {
                scatter_state(state, lane, result.final_state.view());
            }
            checkpoints.push(result.checkpoints);
        }

        let mut tensors = vec![("output", TensorHealth::inspect(&output))];
        if let Some(state) = &final_state {
            tensors.push(("final_state", TensorHealth::inspect(state)));
        }
        let health = HealthReport::new(tensors);
        health.log("forward");

        let saved = self.config.save_for_backward.then(|| {
            SavedContext::capture(
                inputs,
                dims,
                self.config.chunk_len,
                scale,
                self.config.precision,
                mode,
                self.config.checkpoint,
                checkpoints,
            )
        });

        Ok(ForwardOutput {
            output,
            final_state,
            saved,
            health,
        })
    }

    /// Gradients of a scalar loss with respect to the inputs of a saved
    /// forward call, given `∂loss/∂output`.
    pub fn backward(
        &self,
        grad_output: ArrayView4<'_, f32>,
        saved: &SavedContext,
        request: &BackwardRequest<'_>,
    ) -> Result<Gradients> {
        if saved.chunk_len != self.config.chunk_len {
            return Err(ScanError::ChunkLayoutMismatch {
                saved: saved.chunk_len,
                requested: self.config.chunk_len,
            });
        }
        let dims = saved.dims;
        let expected = (dims.batch, dims.seq_len, dims.heads, dims.dv);
        if grad_output.dim() != expected {
            return Err(ScanError::shape(
                "grad_output",
                format!("expected {:?}, got {:?}", expected, grad_output.dim()),
            ));
        }
        if let Some(g) = request.grad_final_state {
            if g.dim() != dims.state_shape() {
                return Err(ScanError::shape(
                    "grad_final_state",
                    format!("expected {:?}, got {:?}", dims.state_shape(), g.dim()),
                ));
            }
        }

        let inputs = saved.inputs();
        let layout = LaneLayout::new(&dims, inputs.cu_seqlens);
        debug!(
            lanes = layout.len(),
            chunk_len = saved.chunk_len,
            strategy = %saved.strategy,
            kept_states = saved.kept_states(),
            precision = %saved.precision,
            "chunked backward"
        );

        match saved.precision {
            Precision::F32 => self.backward_with::<f32>(grad_output, saved, request, &inputs, &layout),
            Precision::F64 => self.backward_with::<f64>(grad_output, saved, request, &inputs, &layout),
        }
    }

    fn backward_with<A: Accum>(
        &self,
        grad_output: ArrayView4<'_, f32>,
        saved: &SavedContext,
        request: &BackwardRequest<'_>,
        inputs: &AttentionInputs<'_>,
        layout: &LaneLayout,
    ) -> Result<Gradients> {
        let dims = saved.dims;
        let plan = ChunkPlan::new(saved.chunk_len)?;
        let scale = A::lift64(saved.scale);
        let indices: Vec<usize> = (0..layout.len()).collect();

        let lanes: Vec<LaneGrads<A>> = self.config.execution.try_run(&indices, |&idx| {
            let lane = &layout.lanes[idx];
            trace!(slot = lane.slot, head = lane.head, len = lane.len(), "backward lane");
            let gathered = LaneInputs::<A>::gather(inputs, lane);
            let grad_out = lift_block::<A>(lane_rows(grad_output, lane, lane.start..lane.end));
            let grad_final = request.grad_final_state.map(|g| lane_state::<A>(g, lane));
            backward_lane(
                &gathered,
                &saved.checkpoints[idx],
                saved.strategy,
                plan,
                scale,
                grad_out.view(),
                grad_final.as_ref().map(|g| g.view()),
            )
        })?;

        let mut query = Array4::zeros(inputs.query.raw_dim());
        let mut key = Array4::zeros(inputs.key.raw_dim());
        let mut value = Array4::zeros(inputs.value.raw_dim());
        let mut gates = inputs.gates.map(|g| Array4::zeros(g.raw_dim()));
        let mut initial_state = request
            .initial_state
            .then(|| Array4::zeros(dims.state_shape()));

        for (lane, grads) in layout.lanes.iter().zip(lanes) {
            scatter_rows(&mut query, lane, grads.dq.view());
            scatter_rows(&mut key, lane, grads.dk.view());
            scatter_rows(&mut value, lane, grads.dv.view());
            if let (Some(target), Some(dg)) = (gates.as_mut(), grads.dg.as_ref()) {
                if dims.gate_dim == Some(1) {
                    scatter_rows(target, lane, reduce_gate(dg.view()).view());
                } else {
                    scatter_rows(target, lane, dg.view());
                }
            }
            if let Some(target) = initial_state.as_mut() {
                scatter_state(target, lane, grads.d_initial.view());
            }
        }

        let mut tensors = vec![
            ("grad_query", TensorHealth::inspect(&query)),
            ("grad_key", TensorHealth::inspect(&key)),
            ("grad_value", TensorHealth::inspect(&value)),
        ];
        if let Some(g) = &gates {
            tensors.push(("grad_gates", TensorHealth::inspect(g)));
        }
        if let Some(s) = &initial_state {
            tensors.push(("grad_initial_state", TensorHealth::inspect(s)));
        }
        let health = HealthReport::new(tensors);
        health.log("backward");

        Ok(Gradients {
            query,
            key,
            value,
            gates,
            initial_state,
            health,
        })
    }
}

fn initial_lane_state<A: Accum>(
    inputs: &AttentionInputs<'_>,
    lane: &Lane,
    dims: &Dims,
) -> Array2<A> {
    match inputs.initial_state {
        Some(state) => lane_state(state, lane),
        None => Array2::zeros((dims.dk, dims.dv)),
    }
}
