//! Core scan: inputs, lane partitioning, chunked and recurrent drivers, and
//! the persistable state.

pub mod inputs;
pub mod lane;
pub mod layout;
pub mod recurrent;
pub mod scan;
pub mod state;
