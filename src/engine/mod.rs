//! Comparison engine: what to compare and how to compare it

pub mod diff;
pub mod resolver;
