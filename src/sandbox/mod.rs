//! Sandbox module - jail description
//!
//! This module describes the externally provisioned jail:
//! - Jail root and candidate working directory
//! - In-jail to host path mapping
//! - Executable path checks
//!
//! The sandbox module does NOT:
//! - Build the jail (namespaces, mounts, limits)
//! - Run programs (that's the runner's job)
//! - Compare outputs

pub mod config;

// Re-exports for convenience
pub use config::JailConfig;
