//! Runtime module: the public engine built on the kernels and the scan driver.
//!
//! This module provides:
//! - Engine configuration with environment overrides
//! - Chunked forward and backward over all lanes
//! - Saved context for backward
//! - Health reporting of results
//! - Streaming inference with a persistable state

pub mod config;
pub mod engine;
pub mod health;
pub mod saved;
pub mod stream;
