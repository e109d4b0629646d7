//! Execution store implementations.

pub mod memory;
