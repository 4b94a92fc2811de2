//! The scheduler and worker pool.
//!
//! A single scheduler loop owns the DAG state; workers are tokio tasks bounded
//! by a semaphore sized to `--parallelism`. Units move through
//! `pending -> ready -> running -> terminal`; destroy runs traverse the DAG in
//! reverse. The first interrupt stops scheduling and drains running units, the
//! second forwards kill signals to engine subprocesses.

pub mod engine;
pub mod hooks;
pub mod logwriter;
pub mod workdir;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::outputs::OutputsCache;
use crate::config::eval::{EvalMode, Evaluator};
use crate::config::model::{DependencyConfig, UnitConfig, CONFIG_FILENAME};
use crate::discovery::{self, DiscoveredTree};
use crate::error::{display_relative, Error, Result};
use crate::options::RunOptions;
use crate::policy::errors::{classify_failure, FailureDisposition};
use crate::policy::exclude;
use crate::report::{RunReport, UnitReport, UnitStatus};
use crate::runner::engine::EngineCommand;
use crate::runner::logwriter::{LogMultiplexer, StreamKind};

#[derive(Debug, Clone)]
pub struct UnitResult {
    pub status: UnitStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    pub message: Option<String>,
    pub ignored_by: Option<String>,
    pub signals: BTreeMap<String, JsonValue>,
}

impl UnitResult {
    fn new(status: UnitStatus) -> Self {
        Self {
            status,
            attempts: 0,
            duration_ms: 0,
            message: None,
            ignored_by: None,
            signals: BTreeMap::new(),
        }
    }

    fn excluded() -> Self {
        Self::new(UnitStatus::Excluded)
    }

    fn early_exit(reason: impl Into<String>) -> Self {
        let mut r = Self::new(UnitStatus::EarlyExit);
        r.message = Some(reason.into());
        r
    }
}

#[derive(Debug, Clone)]
struct UnitSpec {
    dir: PathBuf,
    config_path: PathBuf,
    rel: String,
    dependencies: BTreeMap<String, DependencyConfig>,
    dep_dirs: BTreeMap<String, PathBuf>,
    /// Engine binary per dependency label, resolved from that dependency's
    /// own configuration so output fetches honor its `terraform_binary`.
    dep_binaries: BTreeMap<String, PathBuf>,
    has_dependents: bool,
}

struct Shared {
    options: Arc<RunOptions>,
    evaluator: Evaluator,
    outputs: Arc<OutputsCache>,
    mux: LogMultiplexer,
    kill: CancellationToken,
    sem: Arc<Semaphore>,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeState {
    Pending,
    Running,
    Done(UnitStatus),
}

pub struct Runner {
    options: Arc<RunOptions>,
    evaluator: Evaluator,
    outputs: Arc<OutputsCache>,
    mux: LogMultiplexer,
    /// First interrupt: stop picking new units.
    cancel: CancellationToken,
    /// Second interrupt: forward kill to running subprocesses.
    kill: CancellationToken,
}

impl Runner {
    pub fn new(
        options: Arc<RunOptions>,
        evaluator: Evaluator,
        outputs: Arc<OutputsCache>,
        mux: LogMultiplexer,
        cancel: CancellationToken,
        kill: CancellationToken,
    ) -> Self {
        Self {
            options,
            evaluator,
            outputs,
            mux,
            cancel,
            kill,
        }
    }

    fn shared(&self) -> Arc<Shared> {
        Arc::new(Shared {
            options: self.options.clone(),
            evaluator: self.evaluator.clone(),
            outputs: self.outputs.clone(),
            mux: self.mux.clone(),
            kill: self.kill.clone(),
            sem: Arc::new(Semaphore::new(self.options.parallelism.max(1))),
        })
    }

    /// Execute every scheduled unit in DAG order and collect the run report.
    pub async fn run(&self, tree: &DiscoveredTree) -> Result<RunReport> {
        let started = Instant::now();
        let root = self
            .options
            .working_dir
            .canonicalize()
            .unwrap_or_else(|_| self.options.working_dir.clone());
        let destroy = self.options.is_destroy();
        let shared = self.shared();

        let mut state: BTreeMap<PathBuf, NodeState> = BTreeMap::new();
        let mut results: BTreeMap<PathBuf, UnitResult> = BTreeMap::new();
        for unit in tree.units.values() {
            if unit.excluded {
                state.insert(unit.dir.clone(), NodeState::Done(UnitStatus::Excluded));
                results.insert(unit.dir.clone(), UnitResult::excluded());
            } else {
                state.insert(unit.dir.clone(), NodeState::Pending);
            }
        }

        let mut join_set: JoinSet<(PathBuf, UnitResult)> = JoinSet::new();

        loop {
            // Scheduling passes until the frontier is stable. BTreeMap order
            // keeps the ready set deterministic by canonical path.
            loop {
                let mut changed = false;
                let pending: Vec<PathBuf> = state
                    .iter()
                    .filter(|(_, s)| **s == NodeState::Pending)
                    .map(|(d, _)| d.clone())
                    .collect();
                for dir in pending {
                    let ix = tree.dag.node(&dir).expect("discovered unit is in the dag");
                    let upstream = if destroy {
                        tree.dag.dependents_of(ix)
                    } else {
                        tree.dag.dependencies_of(ix)
                    };

                    let mut all_terminal = true;
                    let mut blocked: Option<String> = None;
                    for up in upstream {
                        let up_dir = tree.dag.dir(up);
                        match state.get(up_dir) {
                            Some(NodeState::Done(UnitStatus::Succeeded))
                            | Some(NodeState::Done(UnitStatus::Excluded)) => {}
                            Some(NodeState::Done(UnitStatus::Failed)) => {
                                if !self.options.ignore_dependency_errors {
                                    blocked = Some(format!(
                                        "dependency {} failed",
                                        display_relative(up_dir, &root)
                                    ));
                                }
                            }
                            Some(NodeState::Done(_)) => {
                                blocked = Some(format!(
                                    "dependency {} did not run",
                                    display_relative(up_dir, &root)
                                ));
                            }
                            _ => all_terminal = false,
                        }
                    }
                    if !all_terminal {
                        continue;
                    }
                    if let Some(reason) = blocked {
                        state.insert(dir.clone(), NodeState::Done(UnitStatus::EarlyExit));
                        results.insert(dir.clone(), UnitResult::early_exit(reason));
                        changed = true;
                        continue;
                    }
                    if self.cancel.is_cancelled() {
                        state.insert(dir.clone(), NodeState::Done(UnitStatus::EarlyExit));
                        results.insert(dir.clone(), UnitResult::early_exit("run cancelled"));
                        changed = true;
                        continue;
                    }

                    let unit = &tree.units[&dir];
                    let dep_binaries = unit
                        .dep_dirs
                        .iter()
                        .map(|(label, dep_dir)| {
                            let binary = tree
                                .units
                                .get(dep_dir)
                                .map(|dep| engine::resolve_binary(&self.options, &dep.config))
                                .unwrap_or_else(|| {
                                    engine::resolve_binary(&self.options, &UnitConfig::default())
                                });
                            (label.clone(), binary)
                        })
                        .collect();
                    let spec = UnitSpec {
                        dir: dir.clone(),
                        config_path: unit.config_path.clone(),
                        rel: display_relative(&dir, &root),
                        dependencies: unit.config.dependencies.clone(),
                        dep_dirs: unit.dep_dirs.clone(),
                        dep_binaries,
                        has_dependents: !tree.dag.dependents_of(ix).is_empty(),
                    };
                    let shared = shared.clone();
                    state.insert(dir.clone(), NodeState::Running);
                    join_set.spawn(async move {
                        let result = execute_unit(shared, &spec).await;
                        (spec.dir, result)
                    });
                    changed = true;
                }
                if !changed {
                    break;
                }
            }

            match join_set.join_next().await {
                Some(joined) => {
                    let (dir, result) = joined.expect("worker task panicked");
                    if result.status == UnitStatus::Failed && self.options.fail_fast {
                        warn!(unit = %display_relative(&dir, &root), "failure with --fail-fast, cancelling the run");
                        self.cancel.cancel();
                    }
                    state.insert(dir.clone(), NodeState::Done(result.status));
                    results.insert(dir, result);
                }
                None => break,
            }
        }

        for (dir, s) in &state {
            if *s == NodeState::Pending {
                results.insert(dir.clone(), UnitResult::early_exit("never became ready"));
            }
        }

        Ok(self.build_report(&root, results, started))
    }

    /// Single-unit mode: the working directory is the unit.
    pub async fn run_single(&self) -> Result<(UnitResult, bool)> {
        let root = self
            .options
            .working_dir
            .canonicalize()
            .map_err(|e| Error::parse(&self.options.working_dir, format!("cannot resolve: {e}")))?;
        let config_path = root.join(CONFIG_FILENAME);
        if !config_path.is_file() {
            return Err(Error::parse(
                &config_path,
                "no configuration file in the working directory",
            ));
        }

        let partial =
            self.evaluator
                .evaluate_unit(&config_path, EvalMode::Partial, &BTreeMap::new())?;
        let exclusion = exclude::evaluate(&partial.excludes, &self.options.command);
        if exclusion.is_excluded() || partial.skip {
            info!(unit = %root.display(), "unit excluded, engine not invoked");
            return Ok((UnitResult::excluded(), exclusion.early_exit(false)));
        }

        let mut dep_dirs = BTreeMap::new();
        let mut dep_binaries = BTreeMap::new();
        for (label, dep) in &partial.dependencies {
            let target = discovery::resolve_dep_dir(&root, &config_path, label, &dep.config_path)?;
            let dep_cfg = self.evaluator.evaluate_unit(
                &target.join(CONFIG_FILENAME),
                EvalMode::Partial,
                &BTreeMap::new(),
            )?;
            dep_binaries.insert(label.clone(), engine::resolve_binary(&self.options, &dep_cfg));
            dep_dirs.insert(label.clone(), target);
        }

        let spec = UnitSpec {
            dir: root,
            config_path,
            rel: String::new(),
            dependencies: partial.dependencies,
            dep_dirs,
            dep_binaries,
            has_dependents: false,
        };
        Ok((execute_unit(self.shared(), &spec).await, false))
    }

    fn build_report(
        &self,
        root: &std::path::Path,
        results: BTreeMap<PathBuf, UnitResult>,
        started: Instant,
    ) -> RunReport {
        let units = results
            .into_iter()
            .map(|(dir, r)| UnitReport {
                path: display_relative(&dir, root),
                status: r.status,
                attempts: r.attempts,
                duration_ms: r.duration_ms,
                message: r.message,
                ignored_by: r.ignored_by,
                signals: r.signals,
            })
            .collect();
        RunReport {
            command: self.options.command.clone(),
            working_dir: root.display().to_string(),
            units,
            read_files: self
                .evaluator
                .reads()
                .iter()
                .map(|p| display_relative(p, root))
                .collect(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

async fn execute_unit(shared: Arc<Shared>, spec: &UnitSpec) -> UnitResult {
    let Ok(_permit) = shared.sem.clone().acquire_owned().await else {
        return UnitResult::early_exit("runner shut down");
    };
    let started = Instant::now();
    if shared.kill.is_cancelled() {
        let mut r = UnitResult::new(UnitStatus::Cancelled);
        r.message = Some("run cancelled".into());
        return r;
    }

    let mut result = match try_execute(&shared, spec).await {
        Ok(r) => r,
        Err(Error::Cancelled) => {
            let mut r = UnitResult::new(UnitStatus::Cancelled);
            r.message = Some("run cancelled".into());
            r
        }
        Err(e) => {
            let mut r = UnitResult::new(UnitStatus::Failed);
            r.message = Some(e.to_string());
            r
        }
    };
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}

async fn try_execute(shared: &Arc<Shared>, spec: &UnitSpec) -> Result<UnitResult> {
    // Pass D resolution: dependency outputs via the single-flight cache.
    let mut resolved: BTreeMap<String, JsonValue> = BTreeMap::new();
    for (label, dep) in &spec.dependencies {
        if !dep.enabled || dep.skip_outputs {
            continue;
        }
        let Some(dep_dir) = spec.dep_dirs.get(label) else {
            continue;
        };
        let binary = spec
            .dep_binaries
            .get(label)
            .cloned()
            .unwrap_or_else(|| engine::resolve_binary(&shared.options, &UnitConfig::default()));
        let outputs = shared
            .outputs
            .get_or_fetch(dep_dir, || engine::fetch_outputs(binary, dep_dir.clone()))
            .await;
        if let Some(value) = outputs.ready() {
            resolved.insert(label.clone(), value);
        }
    }

    let cfg = shared
        .evaluator
        .evaluate_unit(&spec.config_path, EvalMode::Full, &resolved)?;

    if shared.options.is_destroy() && cfg.prevent_destroy {
        return Err(Error::PreventDestroy(spec.dir.clone()));
    }

    let work_dir = workdir::materialize(&shared.options, &spec.dir, &cfg)?;
    for gen in cfg.generate.values() {
        workdir::write_generated(&work_dir, gen)?;
    }
    if let Some(rs) = &cfg.remote_state {
        workdir::write_remote_state(&work_dir, rs)?;
    }

    let binary = engine::resolve_binary(&shared.options, &cfg);
    let (args, extra_env) = engine::build_invocation(&shared.options, &cfg, &work_dir);
    let mut env = engine::tf_var_env(&cfg.inputs);
    env.extend(extra_env);

    let command = shared.options.command.clone();
    let grace = Duration::from_secs(shared.options.graceful_timeout_secs);
    let timeout = shared.options.timeout_secs.map(Duration::from_secs);

    let mut attempt: u32 = 1;
    loop {
        hooks::run_hooks(
            &cfg.terraform.before_hook,
            &command,
            false,
            &work_dir,
            &env,
            &shared.mux,
            &spec.rel,
        )
        .await?;

        let cmd = EngineCommand {
            binary: binary.clone(),
            args: args.clone(),
            work_dir: work_dir.clone(),
            env: env.clone(),
        };
        let outcome =
            engine::run_streaming(&cmd, &shared.mux, &spec.rel, &shared.kill, timeout, grace)
                .await?;
        if outcome.cancelled {
            return Err(Error::Cancelled);
        }

        if outcome.success() {
            hooks::run_hooks(
                &cfg.terraform.after_hook,
                &command,
                false,
                &work_dir,
                &env,
                &shared.mux,
                &spec.rel,
            )
            .await?;

            if spec.has_dependents && command == "apply" {
                let _ = shared
                    .outputs
                    .get_or_fetch(&spec.dir, || {
                        engine::fetch_outputs(binary.clone(), work_dir.clone())
                    })
                    .await;
            }

            let mut result = UnitResult::new(UnitStatus::Succeeded);
            result.attempts = attempt;
            return Ok(result);
        }

        let stderr = if outcome.timed_out {
            format!(
                "{}\n{}",
                Error::Deadline(shared.options.timeout_secs.unwrap_or_default()),
                outcome.stderr
            )
        } else {
            outcome.stderr.clone()
        };

        hooks::run_hooks(
            &cfg.terraform.after_hook,
            &command,
            true,
            &work_dir,
            &env,
            &shared.mux,
            &spec.rel,
        )
        .await?;
        hooks::run_error_hooks(
            &cfg.terraform.error_hook,
            &command,
            &stderr,
            &work_dir,
            &env,
            &shared.mux,
            &spec.rel,
        )
        .await?;

        match classify_failure(&cfg.errors, &stderr, attempt)? {
            FailureDisposition::Retry { rule, sleep } => {
                shared.mux.emit(
                    &spec.rel,
                    StreamKind::Stderr,
                    format!(
                        "retry rule {rule:?} matched, attempt {} of engine invocation in {}s",
                        attempt + 1,
                        sleep.as_secs()
                    ),
                );
                tokio::time::sleep(sleep).await;
                attempt += 1;
                continue;
            }
            FailureDisposition::Ignore {
                rule,
                message,
                signals,
            } => {
                if let Some(message) = &message {
                    shared
                        .mux
                        .emit(&spec.rel, StreamKind::Stderr, message.clone());
                }
                let mut result = UnitResult::new(UnitStatus::Succeeded);
                result.attempts = attempt;
                result.ignored_by = Some(rule);
                result.message = message;
                result.signals = signals;
                return Ok(result);
            }
            FailureDisposition::Fail => {
                let mut result = UnitResult::new(UnitStatus::Failed);
                result.attempts = attempt;
                result.message = Some(if outcome.timed_out {
                    Error::Deadline(shared.options.timeout_secs.unwrap_or_default()).to_string()
                } else {
                    Error::EngineFailed {
                        binary: binary.display().to_string(),
                        command: command.clone(),
                        code: outcome.code,
                    }
                    .to_string()
                });
                return Ok(result);
            }
        }
    }
}
