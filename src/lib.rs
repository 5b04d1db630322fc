//! Testcase checker
//!
//! Executes a candidate program once inside a provisioned jail, compares its
//! console output and the files it produced against a recorded expected
//! tree, and emits a structured verdict.
//!
//! - `core`: verdict data model and wire format
//! - `engine`: comparison pair resolution and diffing
//! - `runner`: jailed execution with a hard timeout
//! - `sandbox`: jail description
//! - `components`: the checker that ties a run together
//! - `config`, `report`: loading configuration, delivering verdicts

pub mod components;
pub mod config;
pub mod core;
pub mod engine;
pub mod report;
pub mod runner;
pub mod sandbox;

pub use crate::components::checker::{Checker, CheckerHooks, DefaultHooks};
pub use crate::config::CheckerConfig;
pub use crate::core::verdict::{FileResult, Perm, TcResult, TcStatus};
