//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_CHUNK_LEN, ENV_PREFIX, MAX_CHUNK_LEN};
use crate::error::{Result, ScanError};
use crate::grad::checkpoint::CheckpointStrategy;
use crate::kernels::dispatch::{LaneExecution, Mode};
use crate::kernels::primitives::Precision;

/// Configuration of a [`ChunkedLinearAttention`](crate::ChunkedLinearAttention).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Positions per chunk.
    pub chunk_len: usize,

    /// Upper bound on `chunk_len`; the intra-chunk block is `chunk_len²`.
    pub max_chunk_len: usize,

    /// Whether a gate tensor is expected.
    pub use_gates: bool,

    /// Emit the state after the last position.
    pub return_final_state: bool,

    /// Keep what backward needs.
    pub save_for_backward: bool,

    /// Accumulation precision.
    pub precision: Precision,

    /// Output scale; `None` means `dk^-1/2`.
    pub scale: Option<f32>,

    pub mode: Mode,

    pub checkpoint: CheckpointStrategy,

    pub execution: LaneExecution,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_len: DEFAULT_CHUNK_LEN,
            max_chunk_len: MAX_CHUNK_LEN,
            use_gates: false,
            return_final_state: false,
            save_for_backward: false,
            precision: Precision::F32,
            scale: None,
            mode: Mode::Auto,
            checkpoint: CheckpointStrategy::StoreAll,
            execution: LaneExecution::Parallel,
        }
    }
}

impl EngineConfig {
    pub fn with_chunk_len(mut self, chunk_len: usize) -> Self {
        self.chunk_len = chunk_len;
        self
    }

    pub fn with_gates(mut self, use_gates: bool) -> Self {
        self.use_gates = use_gates;
        self
    }

    pub fn with_final_state(mut self, on: bool) -> Self {
        self.return_final_state = on;
        self
    }

    pub fn with_saved(mut self, on: bool) -> Self {
        self.save_for_backward = on;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointStrategy) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_execution(mut self, execution: LaneExecution) -> Self {
        self.execution = execution;
        self
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_len == 0 {
            return Err(ScanError::InvalidChunkLength(0));
        }
        if self.chunk_len > self.max_chunk_len {
            return Err(ScanError::ChunkTooLarge {
                requested: self.chunk_len,
                max: self.max_chunk_len,
            });
        }
        self.checkpoint.validate()?;
        if let Some(scale) = self.scale {
            if !scale.is_finite() {
                return Err(ScanError::Config {
                    field: "scale",
                    reason: format!("must be finite, got {scale}"),
                });
            }
        }
        Ok(())
    }

    /// Scale applied to `qᵀS` for key dimension `dk`.
    pub fn resolved_scale(&self, dk: usize) -> f64 {
        match self.scale {
            Some(s) => s as f64,
            None if dk == 0 => 1.0,
            None => (dk as f64).powf(-0.5),
        }
    }

    /// Defaults with `CHUNKSCAN_*` overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides(ENV_PREFIX)?;
        Ok(config)
    }

    /// Apply `<PREFIX>_CHUNK_LEN`, `<PREFIX>_PRECISION`, `<PREFIX>_EXECUTION`
    /// and `<PREFIX>_CHECKPOINT_EVERY` from the process environment.
    pub fn apply_env_overrides(&mut self, prefix: &str) -> Result<()> {
        self.apply_overrides_from(prefix, |key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides_from<F>(&mut self, prefix: &str, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(&format!("{prefix}_CHUNK_LEN")) {
            self.chunk_len = val.trim().parse().map_err(|_| ScanError::Config {
                field: "chunk_len",
                reason: format!("not a positive integer: {val:?}"),
            })?;
        }
        if let Some(val) = lookup(&format!("{prefix}_PRECISION")) {
            self.precision = match val.trim().to_ascii_lowercase().as_str() {
                "f32" => Precision::F32,
                "f64" => Precision::F64,
                other => {
                    return Err(ScanError::Config {
                        field: "precision",
                        reason: format!("expected f32 or f64, got {other:?}"),
                    })
                }
            };
        }
        if let Some(val) = lookup(&format!("{prefix}_EXECUTION")) {
            self.execution = match val.trim().to_ascii_lowercase().as_str() {
                "sequential" => LaneExecution::Sequential,
                "parallel" => LaneExecution::Parallel,
                other => {
                    return Err(ScanError::Config {
                        field: "execution",
                        reason: format!("expected sequential or parallel, got {other:?}"),
                    })
                }
            };
        }
        if let Some(val) = lookup(&format!("{prefix}_CHECKPOINT_EVERY")) {
            let n: usize = val.trim().parse().map_err(|_| ScanError::Config {
                field: "checkpoint",
                reason: format!("not an integer: {val:?}"),
            })?;
            self.checkpoint = if n <= 1 {
                CheckpointStrategy::StoreAll
            } else {
                CheckpointStrategy::Every(n)
            };
        }
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.chunk_len, 64);
        assert!(cfg.validate().is_ok());
        assert!((cfg.resolved_scale(16) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_chunk_lengths() {
        assert!(matches!(
            EngineConfig::default().with_chunk_len(0).validate(),
            Err(ScanError::InvalidChunkLength(0))
        ));
        assert!(matches!(
            EngineConfig::default().with_chunk_len(4096).validate(),
            Err(ScanError::ChunkTooLarge { requested: 4096, .. })
        ));
    }

    #[test]
    fn test_explicit_scale() {
        let cfg = EngineConfig::default().with_scale(1.0);
        assert_eq!(cfg.resolved_scale(64), 1.0);
        assert!(EngineConfig::default().with_scale(f32::NAN).validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut cfg = EngineConfig::default();
        cfg.apply_overrides_from(
            "CHUNKSCAN",
            lookup(&[
                ("CHUNKSCAN_CHUNK_LEN", "16"),
                ("CHUNKSCAN_PRECISION", "F64"),
                ("CHUNKSCAN_EXECUTION", "sequential"),
                ("CHUNKSCAN_CHECKPOINT_EVERY", "4"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.chunk_len, 16);
        assert_eq!(cfg.precision, Precision::F64);
        assert_eq!(cfg.execution, LaneExecution::Sequential);
        assert_eq!(cfg.checkpoint, CheckpointStrategy::Every(4));
    }

    #[test]
    fn test_bad_override_is_reported() {
        let mut cfg = EngineConfig::default();
        let err = cfg
            .apply_overrides_from("X", lookup(&[("X_PRECISION", "bf16")]))
            .unwrap_err();
        assert!(err.to_string().contains("precision"));

        let err = cfg
            .apply_overrides_from("X", lookup(&[("X_CHUNK_LEN", "0")]))
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidChunkLength(0)));
    }

    #[test]
    fn test_config_persists() {
        let cfg = EngineConfig::default().with_chunk_len(32).with_gates(true);
        let bytes = bincode::serialize(&cfg).unwrap();
        let back: EngineConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, cfg);
    }
}
