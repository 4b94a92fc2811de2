//! Engine binary invocation.
//!
//! One engine subprocess per unit attempt, spawned in the unit's materialized
//! working directory with inputs exported as `TF_VAR_` environment variables.
//! Stdout and stderr stream through the log multiplexer line by line; stderr
//! is also buffered for the retry/ignore/error-hook machinery. Termination
//! uses SIGTERM, a grace period, then SIGKILL.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::outputs::Outputs;
use crate::config::model::UnitConfig;
use crate::error::{Error, Result};
use crate::options::RunOptions;
use crate::runner::logwriter::{LogMultiplexer, StreamKind};

#[derive(Debug, Clone)]
pub struct EngineCommand {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct EngineOutcome {
    pub code: i32,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl EngineOutcome {
    pub fn success(&self) -> bool {
        self.code == 0 && !self.timed_out && !self.cancelled
    }
}

fn which(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// `--tf-path` beats the unit's `terraform_binary`, which beats `tofu` on the
/// PATH, which beats `terraform`.
pub fn resolve_binary(options: &RunOptions, cfg: &UnitConfig) -> PathBuf {
    if let Some(path) = &options.tf_path {
        return path.clone();
    }
    if let Some(path) = &cfg.terraform_binary {
        return path.clone();
    }
    if which("tofu").is_some() {
        return PathBuf::from("tofu");
    }
    PathBuf::from("terraform")
}

/// Inputs exported as `TF_VAR_<name>`: strings raw, everything else
/// JSON-encoded.
pub fn tf_var_env(inputs: &BTreeMap<String, JsonValue>) -> Vec<(String, String)> {
    inputs
        .iter()
        .map(|(name, value)| {
            let rendered = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            (format!("TF_VAR_{name}"), rendered)
        })
        .collect()
}

/// Assemble the engine argument vector and extra environment for a unit.
pub fn build_invocation(
    options: &RunOptions,
    cfg: &UnitConfig,
    work_dir: &Path,
) -> (Vec<String>, Vec<(String, String)>) {
    let mut args = vec![options.command.clone()];
    let mut env = Vec::new();

    for extra in &cfg.terraform.extra_arguments {
        if !extra.commands.iter().any(|c| c == &options.command) {
            continue;
        }
        args.extend(extra.arguments.iter().cloned());
        for file in &extra.required_var_files {
            args.push(format!("-var-file={file}"));
        }
        for file in &extra.optional_var_files {
            if work_dir.join(file).exists() {
                args.push(format!("-var-file={file}"));
            }
        }
        for (k, v) in &extra.env_vars {
            env.push((k.clone(), v.clone()));
        }
    }

    if options.non_interactive {
        if matches!(
            options.command.as_str(),
            "plan" | "apply" | "destroy" | "init" | "refresh" | "import"
        ) {
            args.push("-input=false".to_string());
        }
        if matches!(options.command.as_str(), "apply" | "destroy") {
            args.push("-auto-approve".to_string());
        }
    }

    args.extend(options.engine_args.iter().cloned());
    (args, env)
}

async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            child.start_kill()?;
            child.wait().await
        }
    }
}

/// Spawn the engine and stream its output until exit, kill-signal, or
/// deadline. The subprocess never outlives the grace period after a kill.
pub async fn run_streaming(
    cmd: &EngineCommand,
    mux: &LogMultiplexer,
    unit: &str,
    kill: &CancellationToken,
    timeout: Option<Duration>,
    grace: Duration,
) -> Result<EngineOutcome> {
    debug!(binary = %cmd.binary.display(), args = ?cmd.args, "spawning engine");
    let mut child = Command::new(&cmd.binary)
        .args(&cmd.args)
        .current_dir(&cmd.work_dir)
        .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Other(format!("failed to spawn {}: {e}", cmd.binary.display())))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let mux_out = mux.clone();
    let unit_out = unit.to_string();
    let out_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            mux_out.emit(&unit_out, StreamKind::Stdout, line);
        }
    });

    let stderr_buf: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let mux_err = mux.clone();
    let unit_err = unit.to_string();
    let buf = stderr_buf.clone();
    let err_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            {
                let mut b = buf.lock().expect("stderr buffer lock");
                b.push_str(&line);
                b.push('\n');
            }
            mux_err.emit(&unit_err, StreamKind::Stderr, line);
        }
    });

    let mut timed_out = false;
    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = kill.cancelled() => {
            cancelled = true;
            terminate(&mut child, grace).await?
        }
        _ = deadline(timeout) => {
            timed_out = true;
            terminate(&mut child, grace).await?
        }
    };

    let _ = out_task.await;
    let _ = err_task.await;
    let stderr = stderr_buf.lock().expect("stderr buffer lock").clone();

    Ok(EngineOutcome {
        code: status.code().unwrap_or(-1),
        stderr,
        timed_out,
        cancelled,
    })
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// `<engine> output -json` with the documented schema
/// `{name: {value, type, sensitive}}`; anything else is `Unavailable`.
pub fn parse_output_json(raw: &str) -> Option<JsonValue> {
    let parsed: JsonValue = serde_json::from_str(raw).ok()?;
    let obj = parsed.as_object()?;
    if obj.is_empty() {
        return None;
    }
    let mut out = JsonMap::new();
    for (name, entry) in obj {
        out.insert(
            name.clone(),
            entry.get("value").cloned().unwrap_or(JsonValue::Null),
        );
    }
    Some(JsonValue::Object(out))
}

/// Fetch a unit's outputs without running apply. Used for external
/// dependencies and units not scheduled in this run.
pub async fn fetch_outputs(binary: PathBuf, dir: PathBuf) -> Outputs {
    debug!(dir = %dir.display(), "fetching outputs via output -json");
    let result = Command::new(&binary)
        .arg("output")
        .arg("-json")
        .current_dir(&dir)
        .stdin(Stdio::null())
        .output()
        .await;
    match result {
        Ok(out) if out.status.success() => {
            parse_output_json(&String::from_utf8_lossy(&out.stdout))
                .map(Outputs::Ready)
                .unwrap_or(Outputs::Unavailable)
        }
        _ => Outputs::Unavailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::logwriter::PathRewriter;
    use serde_json::json;

    fn mux() -> LogMultiplexer {
        let (mux, _handle) = LogMultiplexer::spawn(
            PathRewriter::new(Path::new("/nonexistent")),
            false,
            false,
        );
        mux
    }

    fn sh(script: &str, dir: &Path) -> EngineCommand {
        EngineCommand {
            binary: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
            work_dir: dir.to_path_buf(),
            env: vec![],
        }
    }

    #[tokio::test]
    async fn captures_exit_code_and_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = sh("echo visible; echo oops >&2; exit 3", tmp.path());
        let outcome = run_streaming(
            &cmd,
            &mux(),
            "unit",
            &CancellationToken::new(),
            None,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(outcome.code, 3);
        assert!(outcome.stderr.contains("oops"));
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn kill_token_terminates_within_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = sh("sleep 30", tmp.path());
        let kill = CancellationToken::new();
        kill.cancel();
        let started = std::time::Instant::now();
        let outcome = run_streaming(&cmd, &mux(), "unit", &kill, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn deadline_counts_as_timed_out() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = sh("sleep 30", tmp.path());
        let outcome = run_streaming(
            &cmd,
            &mux(),
            "unit",
            &CancellationToken::new(),
            Some(Duration::from_millis(100)),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }

    #[test]
    fn output_json_schema_maps_to_values() {
        let raw = r#"{"id": {"value": "vpc-1", "type": "string", "sensitive": false}}"#;
        assert_eq!(parse_output_json(raw), Some(json!({"id": "vpc-1"})));
        assert_eq!(parse_output_json("{}"), None);
        assert_eq!(parse_output_json("not json"), None);
    }

    #[test]
    fn tf_vars_encode_strings_raw_and_complex_as_json() {
        let inputs = BTreeMap::from([
            ("name".to_string(), json!("hello")),
            ("count".to_string(), json!(3)),
            ("tags".to_string(), json!({"a": 1})),
        ]);
        let env: BTreeMap<String, String> = tf_var_env(&inputs).into_iter().collect();
        assert_eq!(env["TF_VAR_name"], "hello");
        assert_eq!(env["TF_VAR_count"], "3");
        assert_eq!(env["TF_VAR_tags"], "{\"a\":1}");
    }

    #[test]
    fn invocation_includes_matching_extra_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("optional.tfvars"), "").unwrap();
        let cfg: UnitConfig = {
            let mut cfg = UnitConfig::default();
            cfg.terraform.extra_arguments = vec![serde_json::from_value(json!({
                "commands": ["plan"],
                "arguments": ["-lock-timeout=20m"],
                "env_vars": {"TF_LOG": "info"},
                "optional_var_files": ["optional.tfvars", "missing.tfvars"]
            }))
            .unwrap()];
            cfg
        };
        let mut options = RunOptions::new("plan", tmp.path());
        options.non_interactive = true;
        let (args, env) = build_invocation(&options, &cfg, tmp.path());
        assert_eq!(args[0], "plan");
        assert!(args.contains(&"-lock-timeout=20m".to_string()));
        assert!(args.contains(&"-var-file=optional.tfvars".to_string()));
        assert!(!args.contains(&"-var-file=missing.tfvars".to_string()));
        assert!(args.contains(&"-input=false".to_string()));
        assert!(!args.contains(&"-auto-approve".to_string()));
        assert_eq!(env, vec![("TF_LOG".to_string(), "info".to_string())]);

        let options = {
            let mut o = RunOptions::new("apply", tmp.path());
            o.non_interactive = true;
            o
        };
        let (args, _) = build_invocation(&options, &UnitConfig::default(), tmp.path());
        assert!(args.contains(&"-auto-approve".to_string()));
    }

    #[test]
    fn binary_resolution_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mut options = RunOptions::new("plan", tmp.path());
        let mut cfg = UnitConfig::default();

        cfg.terraform_binary = Some(PathBuf::from("/opt/engine"));
        assert_eq!(resolve_binary(&options, &cfg), PathBuf::from("/opt/engine"));

        options.tf_path = Some(PathBuf::from("/usr/local/bin/tofu"));
        assert_eq!(
            resolve_binary(&options, &cfg),
            PathBuf::from("/usr/local/bin/tofu")
        );
    }
}
