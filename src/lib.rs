//! # chunkscan
//!
//! Chunked causal linear attention on the CPU.
//!
//! Every (sequence, head) lane runs the gated recurrence
//!
//! ```text
//! S_t = diag(exp(g_t)) · S_{t-1} + k_t v_tᵀ      (state ∈ R^{dk × dv})
//! o_t = scale · q_tᵀ S_t
//! ```
//!
//! but evaluates it chunk by chunk: inside a chunk of `L` positions the
//! causal contribution is a dense, lower-triangular `L × L` product, and the
//! chunks are stitched together by a carried state matrix.
//!
//! ## Components
//!
//! 1. **Primitives**: masked scores, cumulative sums and products, gating
//!    ([`kernels::primitives`], [`kernels::gating`])
//! 2. **Intra-chunk solver** ([`kernels::intra_chunk`])
//! 3. **State carry** ([`kernels::state_carry`])
//! 4. **Chunk scan driver** ([`core::scan`], [`core::recurrent`])
//! 5. **Gradient engine** ([`grad`])
//!
//! The element-wise HGRN recurrence lives in [`hgrn`], and the public entry
//! points are collected in [`runtime`].

pub mod core;
pub mod error;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod grad;
pub mod hgrn;
pub mod kernels;
pub mod runtime;

pub use crate::core::inputs::{AttentionInputs, Dims};
pub use crate::core::state::RecurrentState;
pub use crate::error::{Result, ScanError};
pub use crate::grad::checkpoint::CheckpointStrategy;
pub use crate::kernels::dispatch::{LaneExecution, Mode};
pub use crate::kernels::primitives::Precision;
pub use crate::runtime::config::EngineConfig;
pub use crate::runtime::engine::{
    BackwardRequest, ChunkedLinearAttention, ForwardOutput, Gradients,
};
pub use crate::runtime::saved::SavedContext;
pub use crate::runtime::stream::StreamingAttention;

/// Engine-wide constants.
pub mod config {
    /// Default chunk length.
    pub const DEFAULT_CHUNK_LEN: usize = 64;

    /// Largest chunk length accepted unless the caller raises the limit.
    pub const MAX_CHUNK_LEN: usize = 1024;

    /// `Mode::Auto` switches to the position-by-position recurrence for
    /// sequences at most this long when no gradient is needed.
    pub const RECURRENT_MODE_MAX_LEN: usize = 64;

    /// Relative tolerance of f32 accumulation against an f64 reference.
    pub const F32_TOLERANCE: f64 = 1e-3;

    /// Relative tolerance of f64 accumulation against an f64 reference.
    pub const F64_TOLERANCE: f64 = 1e-5;

    /// Environment prefix read by `EngineConfig::apply_env_overrides`.
    pub const ENV_PREFIX: &str = "CHUNKSCAN";
}
