//! Chunk-level kernels.
//!
//! - **primitives**: masked scores, cumulative sums, gate application
//! - **gating**: log-space gate preprocessing
//! - **intra_chunk**: dense causal product inside one chunk
//! - **state_carry**: the state threaded between chunks
//! - **dispatch**: mode resolution and lane scheduling

pub mod dispatch;
pub mod gating;
pub mod intra_chunk;
pub mod primitives;
pub mod state_carry;
