//! Core orchestration engine: discovers configuration units, evaluates their
//! declarative configuration, resolves inter-unit dependencies into a DAG and
//! drives the engine binary across it with bounded concurrency, retry/ignore
//! policy and faithful output streaming.
//!
//! The CLI crate owns argument parsing and exit codes; everything else lives
//! here so the whole orchestration is testable in-process.

pub mod cache;
pub mod config;
pub mod dag;
pub mod discovery;
pub mod error;
pub mod options;
pub mod policy;
pub mod report;
pub mod runner;

pub use error::{Error, Result};

pub fn version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
