//! Error taxonomy for the orchestrator core.
//!
//! Fatal kinds (discovery I/O, cycles, duplicate working dirs) abort the run
//! before any engine invocation. Everything else is contained within a single
//! unit and surfaces in its report row.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // --- Discovery errors: fatal, reported before scheduling starts ---
    #[error("failed to read {}: {source}", .path.display())]
    DirWalk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("units {} and {} resolve to the same working directory {}", .first.display(), .second.display(), .dir.display())]
    DuplicateWorkingDir {
        first: PathBuf,
        second: PathBuf,
        dir: PathBuf,
    },

    #[error("dependency cycle detected: {}", format_cycle(.0))]
    Cycle(Vec<PathBuf>),

    // --- Configuration errors: fatal during discovery, per-unit during full eval ---
    #[error("{}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("{}: could not resolve locals {names:?}: {detail}", .path.display())]
    UnresolvableLocal {
        path: PathBuf,
        names: Vec<String>,
        detail: String,
    },

    #[error("{}: include {label:?} references unknown parent {}", .path.display(), .target.display())]
    UnknownInclude {
        path: PathBuf,
        label: String,
        target: PathBuf,
    },

    #[error("{}: block {block:?}: {message}", .path.display())]
    Block {
        path: PathBuf,
        block: String,
        message: String,
    },

    #[error("{}: {message}", .path.display())]
    Function { path: PathBuf, message: String },

    // --- Dependency errors: treated as configuration errors of the dependent ---
    #[error("{}: dependency {label:?} points outside any discovered unit: {}", .path.display(), .target.display())]
    UnknownDependency {
        path: PathBuf,
        label: String,
        target: PathBuf,
    },

    #[error("{}: dependency {label:?} has no config_path and is not disabled", .path.display())]
    EmptyDependencyPath { path: PathBuf, label: String },

    #[error("{}: outputs of {} are unavailable and no mock_outputs apply for {command:?}", .path.display(), .dependency.display())]
    OutputsUnavailable {
        path: PathBuf,
        dependency: PathBuf,
        command: String,
    },

    // --- Engine / hook errors: per-unit, subject to retry/ignore policy ---
    #[error("{binary} {command} exited with code {code}")]
    EngineFailed {
        binary: String,
        command: String,
        code: i32,
    },

    #[error("hook {name:?} failed: {message}")]
    Hook { name: String, message: String },

    #[error("unit refused: prevent_destroy is set for {}", .0.display())]
    PreventDestroy(PathBuf),

    #[error("engine invocation exceeded the {0}s deadline")]
    Deadline(u64),

    // --- Cancellation: distinct terminal state, not a failure for exit codes ---
    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for conditions that must short-circuit the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DirWalk { .. } | Error::DuplicateWorkingDir { .. } | Error::Cycle(_)
        )
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn block(
        path: impl Into<PathBuf>,
        block: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Block {
            path: path.into(),
            block: block.into(),
            message: message.into(),
        }
    }

    pub fn function(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Function {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_cycle(cycle: &[PathBuf]) -> String {
    cycle
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Relative display helper used by error rendering and the log pipeline.
pub fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .map(|p| {
            let s = p.display().to_string();
            if s.is_empty() {
                ".".to_string()
            } else {
                s
            }
        })
        .unwrap_or_else(|_| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_renders_full_path() {
        let err = Error::Cycle(vec![
            PathBuf::from("a"),
            PathBuf::from("b"),
            PathBuf::from("a"),
        ]);
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::Cycle(vec![]).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::parse("x", "y").is_fatal());
    }

    #[test]
    fn display_relative_falls_back_to_absolute() {
        let root = Path::new("/repo");
        assert_eq!(display_relative(Path::new("/repo/app"), root), "app");
        assert_eq!(display_relative(Path::new("/repo"), root), ".");
        assert_eq!(display_relative(Path::new("/other/app"), root), "/other/app");
    }
}
