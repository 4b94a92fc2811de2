//! Functions available to configuration expressions.
//!
//! The HCL engine dispatches function calls through plain `fn` pointers, so
//! per-run state (caches, the unit directory, CLI context) is reached through
//! a scoped thread-local stack. Evaluation of one configuration file is fully
//! synchronous on one thread; nested evaluations (includes,
//! `read_terragrunt_config`) push their own scope.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::Command as SyncCommand;
use std::sync::{Arc, Mutex};

use hcl::eval::{Context, FuncArgs, FuncDef, ParamType};
use hcl::Value;
use tracing::{debug, info};

use crate::cache::run_cmd::RunCmdCache;
use crate::config::model::CONFIG_FILENAME;
use crate::config::value::{hcl_to_json, json_to_hcl};
use crate::options::RunOptions;
use crate::policy::errors::DEFAULT_RETRYABLE_ERRORS;

type FuncResult = Result<Value, String>;

/// Everything an expression function may need about the evaluation in flight.
#[derive(Debug)]
pub struct EvalScope {
    pub config_path: PathBuf,
    pub unit_dir: PathBuf,
    pub options: Arc<RunOptions>,
    /// Include label -> parent configuration directory.
    pub include_dirs: BTreeMap<String, PathBuf>,
    pub run_cmd_cache: Arc<RunCmdCache>,
    /// Files this run's configuration consumed, for the run report.
    pub reads: Arc<Mutex<Vec<PathBuf>>>,
}

impl EvalScope {
    pub fn record_read(&self, path: PathBuf) {
        self.reads.lock().expect("reads registry lock").push(path);
    }
}

thread_local! {
    static SCOPES: RefCell<Vec<Arc<EvalScope>>> = const { RefCell::new(Vec::new()) };
}

struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPES.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

pub fn with_scope<T>(scope: Arc<EvalScope>, f: impl FnOnce() -> T) -> T {
    SCOPES.with(|s| s.borrow_mut().push(scope));
    let _guard = ScopeGuard;
    f()
}

pub(crate) fn current_scope() -> Result<Arc<EvalScope>, String> {
    SCOPES
        .with(|s| s.borrow().last().cloned())
        .ok_or_else(|| "internal: no evaluation scope active".to_string())
}

/// Relative path from `from` to `to`; both must be absolute.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component<'_>> = from.components().collect();
    let to: Vec<Component<'_>> = to.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for comp in &to[common..] {
        out.push(comp.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

fn arg_str(args: &FuncArgs, idx: usize, func: &str) -> Result<String, String> {
    args[idx]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| format!("{func}: argument {} must be a string", idx + 1))
}

fn resolve_in_unit(scope: &EvalScope, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        p
    } else {
        scope.unit_dir.join(p)
    }
}

fn include_dir(scope: &EvalScope, args: &FuncArgs, func: &str) -> Result<PathBuf, String> {
    if scope.include_dirs.is_empty() {
        return Err(format!("{func}: no include block in this configuration"));
    }
    if args.is_empty() {
        if let Some(dir) = scope.include_dirs.get("") {
            return Ok(dir.clone());
        }
        if scope.include_dirs.len() == 1 {
            return Ok(scope.include_dirs.values().next().unwrap().clone());
        }
        return Err(format!(
            "{func}: multiple labeled includes, pass the label explicitly"
        ));
    }
    let label = arg_str(args, 0, func)?;
    scope
        .include_dirs
        .get(&label)
        .cloned()
        .ok_or_else(|| format!("{func}: no include labeled {label:?}"))
}

// --- path helpers ---

fn get_terragrunt_dir(_args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    Ok(path_value(&scope.unit_dir))
}

fn get_parent_terragrunt_dir(args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    include_dir(&scope, &args, "get_parent_terragrunt_dir").map(|d| path_value(&d))
}

fn get_working_dir(_args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    Ok(path_value(&scope.options.working_dir))
}

fn repo_root_of(dir: &Path) -> Option<PathBuf> {
    let mut cur = Some(dir);
    while let Some(d) = cur {
        if d.join(".git").exists() {
            return Some(d.to_path_buf());
        }
        cur = d.parent();
    }
    None
}

fn get_repo_root(_args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    let root = repo_root_of(&scope.unit_dir).unwrap_or_else(|| scope.options.working_dir.clone());
    Ok(path_value(&root))
}

fn get_path_from_repo_root(_args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    let root = repo_root_of(&scope.unit_dir).unwrap_or_else(|| scope.options.working_dir.clone());
    Ok(path_value(&relative_path(&root, &scope.unit_dir)))
}

fn get_path_to_repo_root(_args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    let root = repo_root_of(&scope.unit_dir).unwrap_or_else(|| scope.options.working_dir.clone());
    Ok(path_value(&relative_path(&scope.unit_dir, &root)))
}

fn path_relative_to_include(args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    let dir = include_dir(&scope, &args, "path_relative_to_include")?;
    Ok(path_value(&relative_path(&dir, &scope.unit_dir)))
}

fn path_relative_from_include(args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    let dir = include_dir(&scope, &args, "path_relative_from_include")?;
    Ok(path_value(&relative_path(&scope.unit_dir, &dir)))
}

/// Walk upward from the unit's directory returning the first file with the
/// given name. Errors if nothing is found and no fallback was given.
fn find_in_parent_folders(args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    let name = if args.is_empty() {
        CONFIG_FILENAME.to_string()
    } else {
        arg_str(&args, 0, "find_in_parent_folders")?
    };

    let mut dir = scope.unit_dir.parent();
    while let Some(d) = dir {
        let candidate = d.join(&name);
        if candidate.is_file() {
            return Ok(path_value(&candidate));
        }
        dir = d.parent();
    }
    if args.len() >= 2 {
        return Ok(args[1].clone());
    }
    Err(format!(
        "find_in_parent_folders: {name:?} not found above {}",
        scope.unit_dir.display()
    ))
}

// --- environment and run context ---

fn get_env(args: FuncArgs) -> FuncResult {
    if args.is_empty() {
        return Err("get_env: expected at least the variable name".into());
    }
    let name = arg_str(&args, 0, "get_env")?;
    match std::env::var(&name) {
        Ok(v) => Ok(Value::String(v)),
        Err(_) if args.len() >= 2 => Ok(args[1].clone()),
        Err(_) => Err(format!("get_env: {name} is not set and no default given")),
    }
}

fn get_platform(_args: FuncArgs) -> FuncResult {
    Ok(Value::String(std::env::consts::OS.to_string()))
}

fn get_terraform_command(_args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    Ok(Value::String(scope.options.command.clone()))
}

fn get_terraform_cli_args(_args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    Ok(Value::Array(
        scope
            .options
            .engine_args
            .iter()
            .map(|a| Value::String(a.clone()))
            .collect(),
    ))
}

fn get_default_retryable_errors(_args: FuncArgs) -> FuncResult {
    Ok(Value::Array(
        DEFAULT_RETRYABLE_ERRORS
            .iter()
            .map(|p| Value::String(p.to_string()))
            .collect(),
    ))
}

// --- subprocesses ---

/// Execute a subprocess and return its stdout. Modifier flags ahead of the
/// command: `--terragrunt-quiet` suppresses the stdout echo,
/// `--terragrunt-no-cache` always re-executes, `--terragrunt-global-cache`
/// caches across the entire run regardless of the calling unit.
fn run_cmd(args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    let mut quiet = false;
    let mut no_cache = false;
    let mut global_cache = false;

    let mut argv = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let s = arg
            .as_str()
            .ok_or_else(|| format!("run_cmd: argument {} must be a string", i + 1))?;
        if argv.is_empty() {
            match s {
                "--terragrunt-quiet" => {
                    quiet = true;
                    continue;
                }
                "--terragrunt-no-cache" => {
                    no_cache = true;
                    continue;
                }
                "--terragrunt-global-cache" => {
                    global_cache = true;
                    continue;
                }
                _ => {}
            }
        }
        argv.push(s.to_string());
    }
    if argv.is_empty() {
        return Err("run_cmd: no command given".into());
    }

    let cache_dir = if global_cache {
        None
    } else {
        Some(scope.unit_dir.as_path())
    };
    let key = RunCmdCache::key(cache_dir, &argv);
    if !no_cache {
        if let Some(cached) = scope.run_cmd_cache.get(&key) {
            debug!(command = %argv[0], "run_cmd cache hit");
            return Ok(Value::String(cached));
        }
    }

    let output = SyncCommand::new(&argv[0])
        .args(&argv[1..])
        .current_dir(&scope.unit_dir)
        .output()
        .map_err(|e| format!("run_cmd: failed to execute {:?}: {e}", argv[0]))?;
    if !output.status.success() {
        return Err(format!(
            "run_cmd: {:?} exited with {}: {}",
            argv[0],
            output.status,
            String::from_utf8_lossy(&output.stderr).trim_end()
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout)
        .trim_end()
        .to_string();
    if !quiet {
        info!(command = %argv[0], "{stdout}");
    }
    if !no_cache {
        scope.run_cmd_cache.put(key, stdout.clone());
    }
    Ok(Value::String(stdout))
}

fn sops_decrypt_file(args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    if args.is_empty() {
        return Err("sops_decrypt_file: expected a file path".into());
    }
    let path = resolve_in_unit(&scope, &arg_str(&args, 0, "sops_decrypt_file")?);
    scope.record_read(path.clone());

    let argv = vec![
        "sops".to_string(),
        "-d".to_string(),
        path.to_string_lossy().into_owned(),
    ];
    let key = RunCmdCache::key(Some(&scope.unit_dir), &argv);
    if let Some(cached) = scope.run_cmd_cache.get(&key) {
        return Ok(Value::String(cached));
    }
    let output = SyncCommand::new(&argv[0])
        .args(&argv[1..])
        .current_dir(&scope.unit_dir)
        .output()
        .map_err(|e| format!("sops_decrypt_file: failed to execute sops: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "sops_decrypt_file: sops exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim_end()
        ));
    }
    let plaintext = String::from_utf8_lossy(&output.stdout).into_owned();
    scope.run_cmd_cache.put(key, plaintext.clone());
    Ok(Value::String(plaintext))
}

// --- file reads ---

fn mark_as_read(args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    if args.is_empty() {
        return Err("mark_as_read: expected a file path".into());
    }
    let raw = arg_str(&args, 0, "mark_as_read")?;
    scope.record_read(resolve_in_unit(&scope, &raw));
    Ok(Value::String(raw))
}

/// Parse a `.tfvars` file: top-level constant attributes only.
fn read_tfvars_file(args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    if args.is_empty() {
        return Err("read_tfvars_file: expected a file path".into());
    }
    let path = resolve_in_unit(&scope, &arg_str(&args, 0, "read_tfvars_file")?);
    scope.record_read(path.clone());

    let src = std::fs::read_to_string(&path)
        .map_err(|e| format!("read_tfvars_file: {}: {e}", path.display()))?;
    let body =
        hcl::parse(&src).map_err(|e| format!("read_tfvars_file: {}: {e}", path.display()))?;

    use hcl::eval::Evaluate;
    let ctx = Context::new();
    let mut out = hcl::Map::new();
    for attr in body.attributes() {
        let value = attr
            .expr()
            .evaluate(&ctx)
            .map_err(|e| format!("read_tfvars_file: {}: {e}", path.display()))?;
        out.insert(attr.key().to_string(), value);
    }
    Ok(Value::Object(out))
}

fn read_terragrunt_config(args: FuncArgs) -> FuncResult {
    let scope = current_scope()?;
    if args.is_empty() {
        return Err("read_terragrunt_config: expected a file path".into());
    }
    let path = resolve_in_unit(&scope, &arg_str(&args, 0, "read_terragrunt_config")?);
    scope.record_read(path.clone());
    let value = super::eval::read_config_from_current_scope(&path)?;
    Ok(json_to_hcl(&value))
}

// --- encoding ---

fn jsondecode(args: FuncArgs) -> FuncResult {
    let raw = arg_str(&args, 0, "jsondecode")?;
    let json: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| format!("jsondecode: {e}"))?;
    Ok(json_to_hcl(&json))
}

fn jsonencode(args: FuncArgs) -> FuncResult {
    if args.is_empty() {
        return Err("jsonencode: expected a value".into());
    }
    let json = hcl_to_json(&args[0]);
    serde_json::to_string(&json)
        .map(Value::String)
        .map_err(|e| format!("jsonencode: {e}"))
}

fn yamldecode(args: FuncArgs) -> FuncResult {
    let raw = arg_str(&args, 0, "yamldecode")?;
    let json: serde_json::Value =
        serde_yaml::from_str(&raw).map_err(|e| format!("yamldecode: {e}"))?;
    Ok(json_to_hcl(&json))
}

fn yamlencode(args: FuncArgs) -> FuncResult {
    if args.is_empty() {
        return Err("yamlencode: expected a value".into());
    }
    let json = hcl_to_json(&args[0]);
    serde_yaml::to_string(&json)
        .map(Value::String)
        .map_err(|e| format!("yamlencode: {e}"))
}

/// Declare every orchestrator function on an evaluation context.
pub fn declare_functions(ctx: &mut Context<'_>) {
    let variadic = |f: fn(FuncArgs) -> FuncResult| {
        FuncDef::builder().variadic_param(ParamType::Any).build(f)
    };

    ctx.declare_func("get_terragrunt_dir", variadic(get_terragrunt_dir));
    ctx.declare_func("get_parent_terragrunt_dir", variadic(get_parent_terragrunt_dir));
    ctx.declare_func("get_working_dir", variadic(get_working_dir));
    ctx.declare_func("get_repo_root", variadic(get_repo_root));
    ctx.declare_func("get_path_from_repo_root", variadic(get_path_from_repo_root));
    ctx.declare_func("get_path_to_repo_root", variadic(get_path_to_repo_root));
    ctx.declare_func("path_relative_to_include", variadic(path_relative_to_include));
    ctx.declare_func("path_relative_from_include", variadic(path_relative_from_include));
    ctx.declare_func("find_in_parent_folders", variadic(find_in_parent_folders));
    ctx.declare_func("get_env", variadic(get_env));
    ctx.declare_func("get_platform", variadic(get_platform));
    ctx.declare_func("get_terraform_command", variadic(get_terraform_command));
    ctx.declare_func("get_terraform_cli_args", variadic(get_terraform_cli_args));
    ctx.declare_func(
        "get_default_retryable_errors",
        variadic(get_default_retryable_errors),
    );
    ctx.declare_func("run_cmd", variadic(run_cmd));
    ctx.declare_func("sops_decrypt_file", variadic(sops_decrypt_file));
    ctx.declare_func("mark_as_read", variadic(mark_as_read));
    ctx.declare_func("read_tfvars_file", variadic(read_tfvars_file));
    ctx.declare_func("read_terragrunt_config", variadic(read_terragrunt_config));
    ctx.declare_func("jsondecode", variadic(jsondecode));
    ctx.declare_func("jsonencode", variadic(jsonencode));
    ctx.declare_func("yamldecode", variadic(yamldecode));
    ctx.declare_func("yamlencode", variadic(yamlencode));
}
