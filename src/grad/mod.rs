//! Gradient engine: per-chunk backward, checkpoint policy, and a
//! finite-difference checker.

pub mod backward;
pub mod check;
pub mod checkpoint;
