//! User-space service supervisor for Unix daemons.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
use libc as _;
#[cfg(test)]
use predicates as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Service configuration store.
pub mod config;

/// Control HTTP interface.
pub mod control;

/// Errors.
pub mod error;

/// Invocation plan codec.
pub mod plan;

/// Service state machine.
pub mod service;

/// Supervisor set.
pub mod supervisor;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
