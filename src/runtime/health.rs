//! Numeric health of forward and backward results.
//!
//! Extreme decays or inputs can drive values to NaN or Inf. The engine never
//! corrects them; it counts them and logs a warning so callers can react.

use ndarray::{ArrayBase, Data, Dimension};

/// Health status levels.
#[derive(Clone, Debug, PartialEq)]
pub enum HealthStatus {
    /// All values finite.
    Healthy,
    /// Finite, but magnitudes beyond the warning threshold.
    Degraded(String),
    /// Non-finite values present.
    Critical(String),
}

/// Finite-value statistics of one tensor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TensorHealth {
    pub len: usize,
    pub non_finite: usize,
    /// Largest finite magnitude.
    pub max_abs: f32,
}

impl TensorHealth {
    pub fn inspect<S, D>(tensor: &ArrayBase<S, D>) -> Self
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        tensor.iter().fold(
            Self {
                len: tensor.len(),
                ..Self::default()
            },
            |mut acc, &v| {
                if v.is_finite() {
                    acc.max_abs = acc.max_abs.max(v.abs());
                } else {
                    acc.non_finite += 1;
                }
                acc
            },
        )
    }

    pub fn is_finite(&self) -> bool {
        self.non_finite == 0
    }
}

/// Health of one engine call.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub tensors: Vec<(&'static str, TensorHealth)>,
}

impl HealthReport {
    /// Magnitude above which a finite result is reported as degraded.
    pub const WARN_MAGNITUDE: f32 = 1e30;

    pub fn new(tensors: Vec<(&'static str, TensorHealth)>) -> Self {
        let status = Self::classify(&tensors);
        Self { status, tensors }
    }

    fn classify(tensors: &[(&'static str, TensorHealth)]) -> HealthStatus {
        if let Some((name, t)) = tensors.iter().find(|(_, t)| !t.is_finite()) {
            return HealthStatus::Critical(format!(
                "{name}: {} of {} values non-finite",
                t.non_finite, t.len
            ));
        }
        if let Some((name, t)) = tensors
            .iter()
            .find(|(_, t)| t.max_abs >= Self::WARN_MAGNITUDE)
        {
            return HealthStatus::Degraded(format!(
                "{name}: max |value| {:.3e} >= warn {:.0e}",
                t.max_abs,
                Self::WARN_MAGNITUDE
            ));
        }
        HealthStatus::Healthy
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Total non-finite values over all tensors.
    pub fn non_finite(&self) -> usize {
        self.tensors.iter().map(|(_, t)| t.non_finite).sum()
    }

    /// Emit a `tracing` warning unless healthy.
    pub fn log(&self, op: &'static str) {
        match &self.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(msg) => tracing::warn!(op, "degraded result: {msg}"),
            HealthStatus::Critical(msg) => {
                tracing::warn!(op, non_finite = self.non_finite(), "non-finite result: {msg}")
            }
        }
    }
}
