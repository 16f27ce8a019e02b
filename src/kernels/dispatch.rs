//! Kernel dispatch: picks the evaluation mode and runs lanes.
//!
//! Two evaluation modes compute the same recurrence:
//!   - **Chunk**: dense intra-chunk products plus a carried state.
//!   - **FusedRecurrent**: one state update per position.
//!
//! `Auto` falls back to the recurrent form for short sequences when no
//! gradient is needed. Lanes are independent and run either sequentially or
//! on the rayon pool.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::RECURRENT_MODE_MAX_LEN;

/// Evaluation mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Auto,
    Chunk,
    FusedRecurrent,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Auto => write!(f, "auto"),
            Mode::Chunk => write!(f, "chunk"),
            Mode::FusedRecurrent => write!(f, "fused_recurrent"),
        }
    }
}

/// Resolve `Auto` to a concrete mode.
pub fn resolve_mode(requested: Mode, seq_len: usize, needs_grad: bool) -> Mode {
    match requested {
        Mode::Auto if !needs_grad && seq_len <= RECURRENT_MODE_MAX_LEN => Mode::FusedRecurrent,
        Mode::Auto => Mode::Chunk,
        other => other,
    }
}

/// How lanes are scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneExecution {
    Sequential,
    #[default]
    Parallel,
}

impl std::fmt::Display for LaneExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaneExecution::Sequential => write!(f, "sequential"),
            LaneExecution::Parallel => write!(f, "parallel"),
        }
    }
}

impl LaneExecution {
    /// Map `f` over `items`, preserving order.
    ///
    /// Every call of `f` owns its result; nothing is reduced across items, so
    /// both schedules produce bit-identical output.
    pub fn run<T, R, F>(self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        match self {
            LaneExecution::Sequential => items.iter().map(f).collect(),
            LaneExecution::Parallel => items.par_iter().map(f).collect(),
        }
    }

    /// Like [`run`](Self::run) for fallible lane work; any failing lane
    /// fails the whole call.
    pub fn try_run<T, R, E, F>(self, items: &[T], f: F) -> Result<Vec<R>, E>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(&T) -> Result<R, E> + Sync + Send,
    {
        match self {
            LaneExecution::Sequential => items.iter().map(f).collect(),
            LaneExecution::Parallel => items.par_iter().map(f).collect(),
        }
    }
}

/// Rough cost model for one call, logged with each dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkCost {
    pub lanes: usize,
    pub chunks_per_lane: usize,
    /// Multiply-adds over all lanes.
    pub flops: f64,
    /// Bytes of state kept per lane for backward.
    pub saved_state_bytes: usize,
}

impl ChunkCost {
    /// Estimate the work of a chunked pass.
    ///
    /// Per chunk: `L²·dk` for scores, `L²·dv` for the intra product,
    /// `L·dk·dv` each for the inter term and the state update.
    pub fn estimate(
        lanes: usize,
        seq_len: usize,
        chunk_len: usize,
        dk: usize,
        dv: usize,
        saved_states_per_lane: usize,
    ) -> Self {
        let chunk_len = chunk_len.max(1);
        let chunks_per_lane = seq_len.div_ceil(chunk_len);
        let l = chunk_len.min(seq_len.max(1)) as f64;
        let per_chunk = l * l * (dk + dv) as f64 + 2.0 * l * (dk * dv) as f64;
        Self {
            lanes,
            chunks_per_lane,
            flops: lanes as f64 * chunks_per_lane as f64 * per_chunk,
            saved_state_bytes: saved_states_per_lane * dk * dv * std::mem::size_of::<f64>(),
        }
    }

    /// Estimate of the recurrent form: `2·dk·dv` per position.
    pub fn estimate_recurrent(lanes: usize, seq_len: usize, dk: usize, dv: usize) -> Self {
        Self {
            lanes,
            chunks_per_lane: seq_len,
            flops: lanes as f64 * seq_len as f64 * 2.0 * (dk * dv) as f64,
            saved_state_bytes: 0,
        }
    }
}
