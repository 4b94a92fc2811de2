//! Hook execution.
//!
//! Hooks for one unit run strictly sequentially in declaration order. A
//! failing `before_hook` aborts the unit; `after_hook`s abort unless they are
//! marked `run_on_error`. `error_hook`s fire only when at least one of their
//! `on_errors` regexes matches the engine stderr.

use std::path::Path;
use std::process::Stdio;

use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use crate::config::model::{ErrorHook, Hook};
use crate::error::{Error, Result};
use crate::runner::logwriter::{LogMultiplexer, StreamKind};

async fn execute(
    name: &str,
    argv: &[String],
    working_dir: &Path,
    env: &[(String, String)],
    mux: &LogMultiplexer,
    unit: &str,
    suppress_stdout: bool,
) -> Result<()> {
    let Some(program) = argv.first() else {
        return Err(Error::Hook {
            name: name.to_string(),
            message: "empty execute list".to_string(),
        });
    };
    debug!(hook = name, program = %program, "running hook");
    let output = Command::new(program)
        .args(&argv[1..])
        .current_dir(working_dir)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Hook {
            name: name.to_string(),
            message: format!("failed to spawn {program:?}: {e}"),
        })?;

    if !suppress_stdout {
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            mux.emit(unit, StreamKind::Stdout, line.to_string());
        }
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        mux.emit(unit, StreamKind::Stderr, line.to_string());
    }

    if !output.status.success() {
        return Err(Error::Hook {
            name: name.to_string(),
            message: format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            ),
        });
    }
    Ok(())
}

/// Run hooks matching the command in declaration order. `engine_failed`
/// selects the after-hook semantics: on a failed unit only `run_on_error`
/// hooks fire, and their own failures no longer change the outcome.
pub async fn run_hooks(
    hooks: &[Hook],
    command: &str,
    engine_failed: bool,
    work_dir: &Path,
    env: &[(String, String)],
    mux: &LogMultiplexer,
    unit: &str,
) -> Result<()> {
    for hook in hooks.iter().filter(|h| h.applies_to(command)) {
        if engine_failed && !hook.run_on_error {
            continue;
        }
        let dir = hook.working_dir.as_deref().unwrap_or(work_dir);
        let result = execute(
            &hook.name,
            &hook.execute,
            dir,
            env,
            mux,
            unit,
            hook.suppress_stdout,
        )
        .await;
        match result {
            Ok(()) => {}
            Err(e) if engine_failed => {
                debug!(hook = %hook.name, "hook failed after engine error: {e}");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Run error hooks whose `on_errors` regexes match the engine stderr. At
/// least one pattern must match; `.*` matches anything.
pub async fn run_error_hooks(
    hooks: &[ErrorHook],
    command: &str,
    stderr: &str,
    work_dir: &Path,
    env: &[(String, String)],
    mux: &LogMultiplexer,
    unit: &str,
) -> Result<()> {
    for hook in hooks.iter().filter(|h| h.applies_to(command)) {
        let mut matched = false;
        for pattern in &hook.on_errors {
            let re = Regex::new(pattern).map_err(|e| Error::Hook {
                name: hook.name.clone(),
                message: format!("invalid on_errors pattern {pattern:?}: {e}"),
            })?;
            if re.is_match(stderr) {
                matched = true;
                break;
            }
        }
        if !matched {
            continue;
        }
        if let Err(e) = execute(
            &hook.name,
            &hook.execute,
            work_dir,
            env,
            mux,
            unit,
            hook.suppress_stdout,
        )
        .await
        {
            debug!(hook = %hook.name, "error hook failed: {e}");
        }
    }
    Ok(())
}
