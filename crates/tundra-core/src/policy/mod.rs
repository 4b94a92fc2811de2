//! Declarative per-unit policies: exclusion, retries and ignores.

pub mod errors;
pub mod exclude;
