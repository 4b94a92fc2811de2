//! Per-run options: the global context handed to discovery, evaluation and
//! the runner. Instantiated once per invocation and shared via `Arc` so tests
//! can run whole orchestrations in parallel without cross-contamination.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value as JsonValue;

/// Directory (under the working dir) holding materialized unit working copies.
pub const CACHE_DIR: &str = ".tundra-cache";

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Engine subcommand, e.g. `plan`, `apply`, `destroy`, `output`.
    pub command: String,
    /// Extra arguments passed through to the engine binary.
    pub engine_args: Vec<String>,
    /// Canonical root of discovery.
    pub working_dir: PathBuf,
    /// Concurrency ceiling for engine subprocesses.
    pub parallelism: usize,
    pub non_interactive: bool,
    /// Multi-unit (`run-all`) mode.
    pub run_all: bool,
    /// Schedule external dependencies instead of fetch-only.
    pub include_external: bool,
    /// Do not halt dependents when a dependency fails.
    pub ignore_dependency_errors: bool,
    /// Cancel everything on the first failure.
    pub fail_fast: bool,
    /// Keep the exit code at 0 even when units fail.
    pub ignore_errors: bool,
    /// CLI feature flag overrides (`--feature k=v`).
    pub features: BTreeMap<String, JsonValue>,
    /// Absolute engine binary path; overrides any `terraform_binary` attribute.
    pub tf_path: Option<PathBuf>,
    pub include_dirs: Vec<String>,
    pub exclude_dirs: Vec<String>,
    /// With strict include, only `--include-dir` matches are scheduled.
    pub strict_include: bool,
    /// Per engine invocation deadline.
    pub timeout_secs: Option<u64>,
    /// Grace between SIGTERM and SIGKILL on forced shutdown.
    pub graceful_timeout_secs: u64,
    pub report_json: Option<PathBuf>,
    /// Prefix each streamed line with the unit's relative path.
    pub log_prefix: bool,
}

impl RunOptions {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            engine_args: Vec::new(),
            working_dir: working_dir.into(),
            parallelism: default_parallelism(),
            non_interactive: false,
            run_all: false,
            include_external: false,
            ignore_dependency_errors: false,
            fail_fast: false,
            ignore_errors: false,
            features: BTreeMap::new(),
            tf_path: None,
            include_dirs: Vec::new(),
            exclude_dirs: Vec::new(),
            strict_include: false,
            timeout_secs: None,
            graceful_timeout_secs: 5,
            report_json: None,
            log_prefix: true,
        }
    }

    /// Destroy traverses the DAG in reverse: dependents are torn down before
    /// their dependencies.
    pub fn is_destroy(&self) -> bool {
        self.command == "destroy"
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Parse a `--feature k=v` value: bool, then integer, then float, then string.
pub fn parse_feature_value(raw: &str) -> JsonValue {
    match raw {
        "true" => return JsonValue::Bool(true),
        "false" => return JsonValue::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return JsonValue::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return JsonValue::Number(n);
        }
    }
    JsonValue::String(raw.to_string())
}
