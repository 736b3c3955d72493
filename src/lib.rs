//! patchbench library crate
//!
//! Everything the `patchbench` binary does is reachable from here, so the
//! end-to-end tests can drive a run with an in-memory model gateway.

pub mod agent;
pub mod batch;
pub mod config;
pub mod diff;
pub mod error;
pub mod harness;
pub mod llm;
pub mod predictions;
pub mod records;
pub mod task;
pub mod util;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;
