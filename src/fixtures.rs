//! Seeded random inputs for tests and gradient checks.

use ndarray::{Array, Array2, Array4, Dimension, ShapeBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::core::inputs::AttentionInputs;
use crate::kernels::gating::log_sigmoid_scalar;

/// Gaussian tensor with standard deviation `std`.
pub fn normal<Sh, D>(shape: Sh, std: f64, rng: &mut StdRng) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
{
    Array::from_shape_simple_fn(shape, || {
        let z: f64 = rng.sample(StandardNormal);
        (z * std) as f32
    })
}

/// Owned tensors that [`AttentionInputs`] borrows from.
#[derive(Clone, Debug)]
pub struct OwnedInputs {
    pub query: Array4<f32>,
    pub key: Array4<f32>,
    pub value: Array4<f32>,
    pub gates: Option<Array4<f32>>,
    pub initial_state: Option<Array4<f32>>,
    pub padding_mask: Option<Array2<bool>>,
    pub cu_seqlens: Option<Vec<usize>>,
}

impl OwnedInputs {
    pub fn as_inputs(&self) -> AttentionInputs<'_> {
        AttentionInputs {
            query: self.query.view(),
            key: self.key.view(),
            value: self.value.view(),
            gates: self.gates.as_ref().map(|g| g.view()),
            initial_state: self.initial_state.as_ref().map(|s| s.view()),
            padding_mask: self.padding_mask.as_ref().map(|m| m.view()),
            cu_seqlens: self.cu_seqlens.as_deref(),
        }
    }
}

/// Builder for [`OwnedInputs`].
#[derive(Clone, Debug)]
pub struct RandomInputs {
    batch: usize,
    seq_len: usize,
    heads: usize,
    dk: usize,
    dv: usize,
    gated: bool,
    per_head_gates: bool,
    initial_state: bool,
    left_padding: Vec<usize>,
    cu_seqlens: Option<Vec<usize>>,
    seed: u64,
}

impl RandomInputs {
    pub fn new(batch: usize, seq_len: usize, heads: usize, dk: usize, dv: usize) -> Self {
        Self {
            batch,
            seq_len,
            heads,
            dk,
            dv,
            gated: false,
            per_head_gates: false,
            initial_state: false,
            left_padding: Vec::new(),
            cu_seqlens: None,
            seed: 0,
        }
    }

    /// Per-feature log-sigmoid gates.
    pub fn gated(mut self, on: bool) -> Self {
        self.gated = on;
        self
    }

    /// One gate per head instead of per feature.
    pub fn per_head_gates(mut self) -> Self {
        self.gated = true;
        self.per_head_gates = true;
        self
    }

    pub fn with_initial_state(mut self) -> Self {
        self.initial_state = true;
        self
    }

    /// Mark the first `pad[b]` positions of batch row `b` as padding.
    pub fn left_padding(mut self, pad: Vec<usize>) -> Self {
        self.left_padding = pad;
        self
    }

    pub fn cu_seqlens(mut self, offsets: Vec<usize>) -> Self {
        self.cu_seqlens = Some(offsets);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> OwnedInputs {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let (b, n, h) = (self.batch, self.seq_len, self.heads);
        let query = normal((b, n, h, self.dk), 1.0, &mut rng);
        let key = normal((b, n, h, self.dk), 1.0, &mut rng);
        let value = normal((b, n, h, self.dv), 1.0, &mut rng);

        // log σ(N(2, 1)) keeps decays in roughly (0.6, 1).
        let gates = self.gated.then(|| {
            let gd = if self.per_head_gates { 1 } else { self.dk };
            normal((b, n, h, gd), 1.0, &mut rng).mapv(|z| log_sigmoid_scalar(z + 2.0))
        });

        let slots = self
            .cu_seqlens
            .as_ref()
            .map_or(b, |o| o.len().saturating_sub(1));
        let initial_state = self
            .initial_state
            .then(|| normal((slots, h, self.dk, self.dv), 0.5, &mut rng));

        let padding_mask = (!self.left_padding.is_empty()).then(|| {
            Array2::from_shape_fn((b, n), |(bi, t)| {
                t >= self.left_padding.get(bi).copied().unwrap_or(0)
            })
        });

        OwnedInputs {
            query,
            key,
            value,
            gates,
            initial_state,
            padding_mask,
            cu_seqlens: self.cu_seqlens,
        }
    }
}
