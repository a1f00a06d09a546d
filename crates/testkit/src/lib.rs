#![warn(missing_docs)]
//! Deterministic testing surfaces: scoped log capture and loopback harnesses.

mod harness;
mod logs;

pub use harness::*;
pub use logs::*;
