//! Directional finite-difference gradient checks.
//!
//! Instead of perturbing every coordinate, the checker draws random unit
//! directions `u` and compares the analytic directional derivative `⟨∇f, u⟩`
//! with the central difference `(f(x + εu) − f(x − εu)) / 2ε`. A handful of
//! directions is enough to catch a wrong term anywhere in the gradient.

use ndarray::{Array, ArrayView, Dimension, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// A unit perturbation direction.
#[derive(Clone, Debug)]
pub struct Tangent<D: Dimension> {
    pub values: Array<f64, D>,
}

impl<D: Dimension> Tangent<D> {
    /// Random unit direction with the shape of `like`.
    pub fn random_unit(like: &Array<f64, D>, rng: &mut StdRng) -> Self {
        let mut values = like.mapv(|_| rng.sample::<f64, _>(StandardNormal));
        let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            values.mapv_inplace(|v| v / norm);
        }
        Self { values }
    }

    /// `x + t·u`.
    pub fn offset(&self, x: &Array<f64, D>, t: f64) -> Array<f64, D> {
        Zip::from(x)
            .and(&self.values)
            .map_collect(|&a, &u| a + t * u)
    }

    /// `⟨grad, u⟩`.
    pub fn project(&self, grad: ArrayView<f64, D>) -> f64 {
        Zip::from(&grad)
            .and(&self.values)
            .fold(0.0, |acc, &g, &u| acc + g * u)
    }
}

/// Central difference of a scalar function of one step size.
pub fn central_difference<F: FnMut(f64) -> f64>(mut f: F, epsilon: f64) -> f64 {
    (f(epsilon) - f(-epsilon)) / (2.0 * epsilon)
}

/// Configuration of a directional check.
#[derive(Clone, Copy, Debug)]
pub struct DirectionalCheck {
    pub epsilon: f64,
    pub directions: usize,
    pub seed: u64,
}

impl Default for DirectionalCheck {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            directions: 4,
            seed: 0x5eed,
        }
    }
}

impl DirectionalCheck {
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Worst relative error over all directions.
    ///
    /// Errors are relative to `max(|analytic|, |numeric|, 1)`, so tiny
    /// directional derivatives are judged absolutely.
    pub fn run<D, F>(&self, point: &Array<f64, D>, grad: ArrayView<f64, D>, loss: F) -> f64
    where
        D: Dimension,
        F: Fn(&Array<f64, D>) -> f64,
    {
        if point.is_empty() {
            return 0.0;
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut worst = 0.0_f64;
        for _ in 0..self.directions {
            let tangent = Tangent::random_unit(point, &mut rng);
            let analytic = tangent.project(grad.view());
            let numeric = central_difference(|t| loss(&tangent.offset(point, t)), self.epsilon);
            let denom = analytic.abs().max(numeric.abs()).max(1.0);
            worst = worst.max((analytic - numeric).abs() / denom);
        }
        worst
    }
}
