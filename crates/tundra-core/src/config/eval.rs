//! Two-phase configuration evaluator.
//!
//! Evaluation runs in deliberately ordered partial passes because the
//! language permits forward references across block kinds while forbidding
//! them within a kind:
//!
//!   A. skeleton parse (block headers, attribute names)
//!   B. include resolution, recursing into parents
//!   C. locals, iterated to a fixed point
//!   D. dependency bindings (outputs, mocks, disabled -> null)
//!   E. remaining sections in fixed order: terraform, inputs, generate,
//!      remote_state, errors, exclude
//!
//! Partial mode stops after the pieces discovery needs (dependency edges,
//! exclusion, skip) and never touches dependency outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use hcl::eval::{Context, Evaluate};
use hcl::{Block, Body, Expression, Value};
use serde::de::DeserializeOwned;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::debug;

use crate::cache::run_cmd::RunCmdCache;
use crate::config::funcs::{self, EvalScope};
use crate::config::merge::{merge_configs, merge_mock_with_state};
use crate::config::model::{
    BlockKind, DependencyConfig, ErrorHook, ErrorsConfig, ExtraArguments, GenerateBlock, Hook,
    IgnoreRule, IncludeConfig, MergeStrategy, RetryRule, TerraformBlock, UnitConfig,
};
use crate::config::value::{hcl_to_json, json_to_hcl};
use crate::error::{Error, Result};
use crate::options::RunOptions;

/// Top-level attributes the language recognizes next to blocks.
const TOP_LEVEL_ATTRS: &[&str] = &[
    "inputs",
    "terraform_binary",
    "terraform_version_constraint",
    "skip",
    "prevent_destroy",
    "iam_role",
    "download_dir",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Discovery: dependency edges, exclusion and skip only.
    Partial,
    /// Everything, with dependency outputs bound.
    Full,
}

/// Evaluates configuration files against one run's context. Cheap to clone;
/// the caches behind it are shared per run.
#[derive(Debug, Clone)]
pub struct Evaluator {
    options: Arc<RunOptions>,
    run_cmd_cache: Arc<RunCmdCache>,
    reads: Arc<Mutex<Vec<PathBuf>>>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct IncludeAttrs {
    path: String,
    #[serde(default)]
    expose: bool,
    #[serde(default)]
    merge_strategy: MergeStrategy,
}

impl Evaluator {
    pub fn new(options: Arc<RunOptions>, run_cmd_cache: Arc<RunCmdCache>) -> Self {
        Self {
            options,
            run_cmd_cache,
            reads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Files consumed by configuration so far (includes, read functions).
    pub fn reads(&self) -> Vec<PathBuf> {
        self.reads.lock().expect("reads registry lock").clone()
    }

    pub fn reads_handle(&self) -> Arc<Mutex<Vec<PathBuf>>> {
        self.reads.clone()
    }

    /// Evaluate one unit's configuration. `resolved` maps dependency labels to
    /// their real outputs where the caller could obtain them; the evaluator
    /// falls back to mocks per the block's allow-list and errors otherwise.
    pub fn evaluate_unit(
        &self,
        config_path: &Path,
        mode: EvalMode,
        resolved: &BTreeMap<String, JsonValue>,
    ) -> Result<UnitConfig> {
        let mut chain = Vec::new();
        self.evaluate_inner(config_path, mode, resolved, &mut chain)
    }

    fn evaluate_inner(
        &self,
        config_path: &Path,
        mode: EvalMode,
        resolved: &BTreeMap<String, JsonValue>,
        chain: &mut Vec<PathBuf>,
    ) -> Result<UnitConfig> {
        let config_path = config_path
            .canonicalize()
            .map_err(|e| Error::parse(config_path, format!("cannot resolve path: {e}")))?;
        if chain.contains(&config_path) {
            let mut cycle: Vec<String> = chain.iter().map(|p| p.display().to_string()).collect();
            cycle.push(config_path.display().to_string());
            return Err(Error::parse(
                &config_path,
                format!("circular include chain: {}", cycle.join(" -> ")),
            ));
        }
        chain.push(config_path.clone());
        let result = self.eval_one(&config_path, mode, resolved, chain);
        chain.pop();
        result
    }

    fn eval_one(
        &self,
        config_path: &Path,
        mode: EvalMode,
        resolved: &BTreeMap<String, JsonValue>,
        chain: &mut Vec<PathBuf>,
    ) -> Result<UnitConfig> {
        debug!(path = %config_path.display(), ?mode, "evaluating configuration");
        let src = std::fs::read_to_string(config_path)
            .map_err(|e| Error::parse(config_path, format!("cannot read file: {e}")))?;
        let body =
            hcl::parse(&src).map_err(|e| Error::parse(config_path, e.to_string()))?;
        validate_skeleton(&body, config_path)?;

        let unit_dir = config_path
            .parent()
            .ok_or_else(|| Error::parse(config_path, "configuration file has no parent directory"))?
            .to_path_buf();

        let mut ctx = Context::new();
        funcs::declare_functions(&mut ctx);

        // Pass: feature flags, constants for the rest of the run.
        let scope = self.scope(config_path, &unit_dir, BTreeMap::new());
        let features = self.eval_features(&body, &ctx, &scope, config_path)?;
        bind_features(&mut ctx, &features);

        // Pass B: includes, recursing into parents.
        let mut includes: Vec<IncludeConfig> = Vec::new();
        let mut parents: Vec<UnitConfig> = Vec::new();
        let mut include_dirs = BTreeMap::new();
        for block in blocks_of(&body, "include") {
            let label = block
                .labels()
                .first()
                .map(|l| l.as_str().to_string())
                .unwrap_or_default();
            let attrs = self.eval_attrs(block.body(), &ctx, &scope, config_path, "include")?;
            let raw: IncludeAttrs = decode_block(config_path, "include", attrs)?;
            let target = unit_dir.join(&raw.path);
            let target = target.canonicalize().map_err(|_| Error::UnknownInclude {
                path: config_path.to_path_buf(),
                label: label.clone(),
                target,
            })?;
            self.reads
                .lock()
                .expect("reads registry lock")
                .push(target.clone());

            let parent = self.evaluate_inner(&target, mode, resolved, chain)?;
            let parent_dir = target
                .parent()
                .ok_or_else(|| Error::parse(&target, "include target has no parent directory"))?
                .to_path_buf();
            include_dirs.insert(label.clone(), parent_dir);
            includes.push(IncludeConfig {
                label,
                path: target,
                strategy: raw.merge_strategy,
                expose: raw.expose,
            });
            parents.push(parent);
        }

        // From here on path functions see the include labels.
        let scope = self.scope(config_path, &unit_dir, include_dirs);

        let exposed: JsonMap<String, JsonValue> = includes
            .iter()
            .zip(parents.iter())
            .filter(|(inc, _)| inc.expose)
            .map(|(inc, parent)| (inc.label.clone(), config_to_value(parent)))
            .collect();
        if !exposed.is_empty() {
            ctx.declare_var("include", json_to_hcl(&JsonValue::Object(exposed)));
        }

        // Pass C: locals to a fixed point.
        let locals = self.eval_locals(&body, &mut ctx, &scope, config_path)?;

        // Pass D: dependency blocks and ordering-only edges.
        let dependencies = self.eval_dependencies(&body, &ctx, &scope, config_path)?;
        let ordering_paths = self.eval_ordering_paths(&body, &ctx, &scope, config_path)?;

        let mut resolved_outputs = BTreeMap::new();
        if mode == EvalMode::Full {
            let mut bindings = JsonMap::new();
            for (label, dep) in &dependencies {
                let value = self.bind_dependency(config_path, &unit_dir, label, dep, resolved)?;
                // A disabled dependency binds the whole reference to null.
                let binding = if dep.enabled {
                    json!({ "outputs": value.clone() })
                } else {
                    JsonValue::Null
                };
                bindings.insert(label.clone(), binding);
                resolved_outputs.insert(label.clone(), value);
            }
            if !bindings.is_empty() {
                ctx.declare_var("dependency", json_to_hcl(&JsonValue::Object(bindings)));
            }
        }

        // Pass E, fixed order. Partial mode stops at what discovery needs.
        let mut cfg = UnitConfig {
            locals,
            dependencies,
            ordering_paths,
            features,
            resolved_outputs,
            ..Default::default()
        };

        if let Some(block) = blocks_of(&body, "terraform").next() {
            match self.eval_terraform(block, &ctx, &scope, config_path) {
                Ok(tf) => cfg.terraform = tf,
                // Discovery only needs `source` for the duplicate working dir
                // check; a terraform block that references dependency outputs
                // is evaluated for real in the full pass.
                Err(e) if mode == EvalMode::Partial => {
                    debug!(path = %config_path.display(), "terraform block deferred to full evaluation: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        if mode == EvalMode::Full {
            cfg.inputs = self.eval_inputs(&body, &ctx, &scope, config_path)?;
            for block in blocks_of(&body, "generate") {
                let name = label_of(block, config_path, "generate")?;
                let attrs = self.eval_attrs(block.body(), &ctx, &scope, config_path, "generate")?;
                let mut gen: GenerateBlock = decode_block(config_path, "generate", attrs)?;
                gen.name = name.clone();
                cfg.generate.insert(name, gen);
            }
            if let Some(block) = blocks_of(&body, "remote_state").next() {
                let attrs =
                    self.eval_attrs(block.body(), &ctx, &scope, config_path, "remote_state")?;
                cfg.remote_state = Some(decode_block(config_path, "remote_state", attrs)?);
            }
            if let Some(block) = blocks_of(&body, "errors").next() {
                cfg.errors = self.eval_errors(block, &ctx, &scope, config_path)?;
            }
        }

        for block in blocks_of(&body, "exclude") {
            let attrs = self.eval_attrs(block.body(), &ctx, &scope, config_path, "exclude")?;
            cfg.excludes
                .push(decode_block(config_path, "exclude", attrs)?);
        }

        self.eval_top_level_attrs(&body, &ctx, &scope, config_path, mode, &mut cfg)?;

        // Fold parents in declaration order; the child wins conflicts.
        for (include, parent) in includes.iter().zip(parents.into_iter()) {
            cfg = merge_configs(&parent, cfg, include.strategy);
        }
        cfg.includes = includes;
        Ok(cfg)
    }

    fn scope(
        &self,
        config_path: &Path,
        unit_dir: &Path,
        include_dirs: BTreeMap<String, PathBuf>,
    ) -> Arc<EvalScope> {
        Arc::new(EvalScope {
            config_path: config_path.to_path_buf(),
            unit_dir: unit_dir.to_path_buf(),
            options: self.options.clone(),
            include_dirs,
            run_cmd_cache: self.run_cmd_cache.clone(),
            reads: self.reads.clone(),
        })
    }

    fn eval_features(
        &self,
        body: &Body,
        ctx: &Context<'_>,
        scope: &Arc<EvalScope>,
        path: &Path,
    ) -> Result<BTreeMap<String, JsonValue>> {
        let mut features = BTreeMap::new();
        for block in blocks_of(body, "feature") {
            let name = label_of(block, path, "feature")?;
            let value = match self.options.features.get(&name) {
                Some(over) => over.clone(),
                None => {
                    let attr = block
                        .body()
                        .attributes()
                        .find(|a| a.key() == "default")
                        .ok_or_else(|| {
                            Error::block(
                                path,
                                format!("feature {name:?}"),
                                "missing required attribute `default`",
                            )
                        })?;
                    let v = funcs::with_scope(scope.clone(), || attr.expr().evaluate(ctx))
                        .map_err(|e| Error::block(path, format!("feature {name:?}"), e.to_string()))?;
                    hcl_to_json(&v)
                }
            };
            features.insert(name, value);
        }
        Ok(features)
    }

    fn eval_locals(
        &self,
        body: &Body,
        ctx: &mut Context<'_>,
        scope: &Arc<EvalScope>,
        path: &Path,
    ) -> Result<BTreeMap<String, JsonValue>> {
        let mut pending: Vec<(String, Expression)> = Vec::new();
        for block in blocks_of(body, "locals") {
            for attr in block.body().attributes() {
                pending.push((attr.key().to_string(), attr.expr().clone()));
            }
        }

        let mut bound: hcl::Map<String, Value> = hcl::Map::new();
        while !pending.is_empty() {
            let mut next = Vec::with_capacity(pending.len());
            let mut last_err = String::new();
            let mut progress = false;
            for (name, expr) in pending {
                match funcs::with_scope(scope.clone(), || expr.evaluate(&*ctx)) {
                    Ok(v) => {
                        bound.insert(name, v);
                        ctx.declare_var("local", Value::Object(bound.clone()));
                        progress = true;
                    }
                    Err(e) => {
                        last_err = e.to_string();
                        next.push((name, expr));
                    }
                }
            }
            if !progress {
                return Err(Error::UnresolvableLocal {
                    path: path.to_path_buf(),
                    names: next.into_iter().map(|(n, _)| n).collect(),
                    detail: last_err,
                });
            }
            pending = next;
        }

        Ok(bound
            .into_iter()
            .map(|(k, v)| (k, hcl_to_json(&v)))
            .collect())
    }

    fn eval_dependencies(
        &self,
        body: &Body,
        ctx: &Context<'_>,
        scope: &Arc<EvalScope>,
        path: &Path,
    ) -> Result<BTreeMap<String, DependencyConfig>> {
        let mut dependencies = BTreeMap::new();
        for block in blocks_of(body, "dependency") {
            let label = label_of(block, path, "dependency")?;
            let attrs = self.eval_attrs(block.body(), ctx, scope, path, "dependency")?;
            let dep: DependencyConfig =
                decode_block(path, &format!("dependency {label:?}"), attrs)?;
            if dep.config_path.is_empty() {
                if dep.enabled {
                    return Err(Error::EmptyDependencyPath {
                        path: path.to_path_buf(),
                        label,
                    });
                }
                // Disabled with an empty path: treated as not present.
                continue;
            }
            dependencies.insert(label, dep);
        }
        Ok(dependencies)
    }

    fn eval_ordering_paths(
        &self,
        body: &Body,
        ctx: &Context<'_>,
        scope: &Arc<EvalScope>,
        path: &Path,
    ) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for block in blocks_of(body, "dependencies") {
            let attrs = self.eval_attrs(block.body(), ctx, scope, path, "dependencies")?;
            let Some(value) = attrs.get("paths") else {
                return Err(Error::block(
                    path,
                    "dependencies",
                    "missing required attribute `paths`",
                ));
            };
            let list: Vec<String> = serde_json::from_value(value.clone())
                .map_err(|e| Error::block(path, "dependencies", format!("paths: {e}")))?;
            paths.extend(list);
        }
        Ok(paths)
    }

    /// Resolve the value bound as `dependency.<label>` per the contract:
    /// disabled -> null, real outputs (merged with mocks per strategy) when
    /// available, mocks when allowed for the command, error otherwise.
    fn bind_dependency(
        &self,
        path: &Path,
        unit_dir: &Path,
        label: &str,
        dep: &DependencyConfig,
        resolved: &BTreeMap<String, JsonValue>,
    ) -> Result<JsonValue> {
        if !dep.enabled {
            return Ok(JsonValue::Null);
        }
        if dep.skip_outputs {
            return Ok(dep.mock_outputs.clone().unwrap_or(JsonValue::Null));
        }
        if let Some(real) = resolved.get(label) {
            return Ok(match &dep.mock_outputs {
                Some(mock) => {
                    merge_mock_with_state(mock, real, dep.mock_outputs_merge_strategy_with_state)
                }
                None => real.clone(),
            });
        }
        if dep.mocks_allowed_for(&self.options.command) {
            return Ok(dep.mock_outputs.clone().expect("checked by mocks_allowed_for"));
        }
        Err(Error::OutputsUnavailable {
            path: path.to_path_buf(),
            dependency: unit_dir.join(&dep.config_path),
            command: self.options.command.clone(),
        })
    }

    fn eval_terraform(
        &self,
        block: &Block,
        ctx: &Context<'_>,
        scope: &Arc<EvalScope>,
        path: &Path,
    ) -> Result<TerraformBlock> {
        let attrs = self.eval_attrs(block.body(), ctx, scope, path, "terraform")?;
        let mut tf: TerraformBlock = decode_block(path, "terraform", attrs)?;

        for inner in block.body().blocks() {
            let name = inner.identifier();
            match name {
                "extra_arguments" => {
                    let label = label_of(inner, path, "extra_arguments")?;
                    let attrs =
                        self.eval_attrs(inner.body(), ctx, scope, path, "extra_arguments")?;
                    let mut extra: ExtraArguments =
                        decode_block(path, &format!("extra_arguments {label:?}"), attrs)?;
                    extra.name = label;
                    tf.extra_arguments.push(extra);
                }
                "before_hook" | "after_hook" => {
                    let label = label_of(inner, path, name)?;
                    let attrs = self.eval_attrs(inner.body(), ctx, scope, path, name)?;
                    let mut hook: Hook =
                        decode_block(path, &format!("{name} {label:?}"), attrs)?;
                    hook.name = label;
                    if name == "before_hook" {
                        tf.before_hook.push(hook);
                    } else {
                        tf.after_hook.push(hook);
                    }
                }
                "error_hook" => {
                    let label = label_of(inner, path, "error_hook")?;
                    let attrs = self.eval_attrs(inner.body(), ctx, scope, path, "error_hook")?;
                    let mut hook: ErrorHook =
                        decode_block(path, &format!("error_hook {label:?}"), attrs)?;
                    hook.name = label;
                    tf.error_hook.push(hook);
                }
                other => {
                    return Err(Error::block(
                        path,
                        "terraform",
                        format!("unknown nested block {other:?}"),
                    ))
                }
            }
        }
        Ok(tf)
    }

    fn eval_inputs(
        &self,
        body: &Body,
        ctx: &Context<'_>,
        scope: &Arc<EvalScope>,
        path: &Path,
    ) -> Result<BTreeMap<String, JsonValue>> {
        let Some(attr) = body.attributes().find(|a| a.key() == "inputs") else {
            return Ok(BTreeMap::new());
        };
        let value = funcs::with_scope(scope.clone(), || attr.expr().evaluate(ctx))
            .map_err(|e| Error::block(path, "inputs", e.to_string()))?;
        match hcl_to_json(&value) {
            JsonValue::Object(map) => Ok(map.into_iter().collect()),
            other => Err(Error::block(
                path,
                "inputs",
                format!("expected an object, got {other}"),
            )),
        }
    }

    fn eval_errors(
        &self,
        block: &Block,
        ctx: &Context<'_>,
        scope: &Arc<EvalScope>,
        path: &Path,
    ) -> Result<ErrorsConfig> {
        let mut errors = ErrorsConfig::default();
        for inner in block.body().blocks() {
            match inner.identifier() {
                "retry" => {
                    let label = label_of(inner, path, "retry")?;
                    let attrs = self.eval_attrs(inner.body(), ctx, scope, path, "retry")?;
                    let mut rule: RetryRule =
                        decode_block(path, &format!("retry {label:?}"), attrs)?;
                    rule.label = label;
                    errors.retries.push(rule);
                }
                "ignore" => {
                    let label = label_of(inner, path, "ignore")?;
                    let attrs = self.eval_attrs(inner.body(), ctx, scope, path, "ignore")?;
                    let mut rule: IgnoreRule =
                        decode_block(path, &format!("ignore {label:?}"), attrs)?;
                    rule.label = label;
                    errors.ignores.push(rule);
                }
                other => {
                    return Err(Error::block(
                        path,
                        "errors",
                        format!("unknown nested block {other:?}"),
                    ))
                }
            }
        }
        Ok(errors)
    }

    fn eval_top_level_attrs(
        &self,
        body: &Body,
        ctx: &Context<'_>,
        scope: &Arc<EvalScope>,
        path: &Path,
        mode: EvalMode,
        cfg: &mut UnitConfig,
    ) -> Result<()> {
        for attr in body.attributes() {
            let key = attr.key();
            // Inputs are handled with the rest of Pass E. Discovery needs
            // `skip`, `download_dir` (duplicate working dir check) and
            // `terraform_binary` (dependents fetch outputs with the
            // dependency's declared engine).
            if key == "inputs"
                || (mode == EvalMode::Partial
                    && !matches!(key, "skip" | "download_dir" | "terraform_binary"))
            {
                continue;
            }
            let value = funcs::with_scope(scope.clone(), || attr.expr().evaluate(ctx))
                .map_err(|e| Error::block(path, key, e.to_string()))?;
            let json = hcl_to_json(&value);
            match key {
                "skip" => {
                    cfg.skip = as_bool(path, key, &json)?;
                }
                "prevent_destroy" => {
                    cfg.prevent_destroy = as_bool(path, key, &json)?;
                }
                "terraform_binary" => {
                    cfg.terraform_binary = Some(PathBuf::from(as_str(path, key, &json)?));
                }
                "terraform_version_constraint" => {
                    cfg.terraform_version_constraint = Some(as_str(path, key, &json)?);
                }
                "iam_role" => {
                    cfg.iam_role = Some(as_str(path, key, &json)?);
                }
                "download_dir" => {
                    cfg.download_dir = Some(PathBuf::from(as_str(path, key, &json)?));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn eval_attrs(
        &self,
        body: &Body,
        ctx: &Context<'_>,
        scope: &Arc<EvalScope>,
        path: &Path,
        block_name: &str,
    ) -> Result<JsonMap<String, JsonValue>> {
        let mut map = JsonMap::new();
        for attr in body.attributes() {
            let value = funcs::with_scope(scope.clone(), || attr.expr().evaluate(ctx))
                .map_err(|e| {
                    Error::block(path, block_name, format!("{}: {e}", attr.key()))
                })?;
            map.insert(attr.key().to_string(), hcl_to_json(&value));
        }
        Ok(map)
    }
}

/// Evaluate another configuration file from inside `read_terragrunt_config`.
/// Dependencies of the target resolve through mocks where allowed; real
/// outputs are not fetched from here.
pub(crate) fn read_config_from_current_scope(
    path: &Path,
) -> std::result::Result<JsonValue, String> {
    let scope = funcs::current_scope()?;
    let evaluator = Evaluator {
        options: scope.options.clone(),
        run_cmd_cache: scope.run_cmd_cache.clone(),
        reads: scope.reads.clone(),
    };
    let cfg = evaluator
        .evaluate_unit(path, EvalMode::Full, &BTreeMap::new())
        .map_err(|e| e.to_string())?;
    Ok(config_to_value(&cfg))
}

/// The value an exposed include (or `read_terragrunt_config`) presents.
pub fn config_to_value(cfg: &UnitConfig) -> JsonValue {
    json!({
        "locals": cfg.locals,
        "inputs": cfg.inputs,
        "feature": cfg.features,
        "terraform": {
            "source": cfg.terraform.source,
            "include_in_copy": cfg.terraform.include_in_copy,
            "exclude_from_copy": cfg.terraform.exclude_from_copy,
        },
        "dependencies": { "paths": cfg.ordering_paths },
    })
}

/// Pass A: every block header and attribute name must be recognized before
/// any expression is evaluated.
fn validate_skeleton(body: &Body, path: &Path) -> Result<()> {
    for block in body.blocks() {
        if BlockKind::from_identifier(block.identifier()).is_none() {
            return Err(Error::block(
                path,
                block.identifier(),
                "unknown block kind",
            ));
        }
    }
    for attr in body.attributes() {
        if !TOP_LEVEL_ATTRS.contains(&attr.key()) {
            return Err(Error::block(
                path,
                attr.key(),
                "unknown top-level attribute",
            ));
        }
    }
    Ok(())
}

fn blocks_of<'a>(body: &'a Body, ident: &'a str) -> impl Iterator<Item = &'a Block> {
    body.blocks().filter(move |b| b.identifier() == ident)
}

fn label_of(block: &Block, path: &Path, kind: &str) -> Result<String> {
    match block.labels() {
        [single] => Ok(single.as_str().to_string()),
        _ => Err(Error::block(
            path,
            kind,
            "expected exactly one label on this block",
        )),
    }
}

fn decode_block<T: DeserializeOwned>(
    path: &Path,
    block_name: &str,
    attrs: JsonMap<String, JsonValue>,
) -> Result<T> {
    serde_json::from_value(JsonValue::Object(attrs))
        .map_err(|e| Error::block(path, block_name, e.to_string()))
}

fn bind_features(ctx: &mut Context<'_>, features: &BTreeMap<String, JsonValue>) {
    if features.is_empty() {
        return;
    }
    let map: JsonMap<String, JsonValue> = features
        .iter()
        .map(|(name, value)| (name.clone(), json!({ "value": value })))
        .collect();
    ctx.declare_var("feature", json_to_hcl(&JsonValue::Object(map)));
}

fn as_bool(path: &Path, key: &str, value: &JsonValue) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::block(path, key, "expected a boolean"))
}

fn as_str(path: &Path, key: &str, value: &JsonValue) -> Result<String> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| Error::block(path, key, "expected a string"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_unit(dir: &Path, rel: &str, contents: &str) -> PathBuf {
        let unit = dir.join(rel);
        fs::create_dir_all(&unit).unwrap();
        let path = unit.join(crate::config::model::CONFIG_FILENAME);
        fs::write(&path, contents).unwrap();
        path
    }

    fn evaluator_for(root: &Path, command: &str) -> Evaluator {
        let mut options = RunOptions::new(command, root);
        options.run_all = true;
        Evaluator::new(Arc::new(options), Arc::new(RunCmdCache::new()))
    }

    #[test]
    fn locals_reach_a_fixed_point_across_forward_references() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_unit(
            tmp.path(),
            "app",
            r#"
locals {
  greeting = "${local.subject} says ${local.word}"
  word     = "hello"
  subject  = "unit"
}

inputs = {
  message = local.greeting
}
"#,
        );
        let cfg = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap();
        assert_eq!(cfg.locals["greeting"], json!("unit says hello"));
        assert_eq!(cfg.inputs["message"], json!("unit says hello"));
    }

    #[test]
    fn unresolvable_local_reports_the_offenders() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_unit(
            tmp.path(),
            "app",
            r#"
locals {
  a = local.b
  b = local.a
}
"#,
        );
        let err = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap_err();
        match err {
            Error::UnresolvableLocal { names, .. } => {
                assert_eq!(names.len(), 2);
            }
            other => panic!("expected UnresolvableLocal, got {other}"),
        }
    }

    #[test]
    fn include_shallow_merge_and_expose() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("root.hcl"),
            r#"
locals {
  region = "eu-west-1"
}

inputs = {
  region = local.region
  size   = "m5.large"
}
"#,
        )
        .unwrap();
        let path = write_unit(
            tmp.path(),
            "app",
            r#"
include "root" {
  path   = find_in_parent_folders("root.hcl")
  expose = true
}

inputs = {
  size    = "m5.xlarge"
  derived = include.root.locals.region
}
"#,
        );
        let cfg = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap();
        assert_eq!(cfg.inputs["region"], json!("eu-west-1"));
        assert_eq!(cfg.inputs["size"], json!("m5.xlarge"));
        assert_eq!(cfg.inputs["derived"], json!("eu-west-1"));
    }

    #[test]
    fn empty_disabled_dependency_is_not_present() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_unit(
            tmp.path(),
            "app",
            r#"
dependency "ghost" {
  config_path = ""
  enabled     = false
}
"#,
        );
        let cfg = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap();
        assert!(cfg.dependencies.is_empty());
    }

    #[test]
    fn empty_enabled_dependency_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_unit(
            tmp.path(),
            "app",
            r#"
dependency "ghost" {
  config_path = ""
}
"#,
        );
        let err = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::EmptyDependencyPath { .. }));
    }

    #[test]
    fn dependency_outputs_bind_real_values() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "vpc", "inputs = {}\n");
        let path = write_unit(
            tmp.path(),
            "app",
            r#"
dependency "vpc" {
  config_path = "../vpc"
}

inputs = {
  vpc_id = dependency.vpc.outputs.id
}
"#,
        );
        let resolved = BTreeMap::from([("vpc".to_string(), json!({"id": "vpc-123"}))]);
        let cfg = evaluator_for(tmp.path(), "apply")
            .evaluate_unit(&path, EvalMode::Full, &resolved)
            .unwrap();
        assert_eq!(cfg.inputs["vpc_id"], json!("vpc-123"));
    }

    #[test]
    fn mocks_substitute_for_allowed_commands_only() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "vpc", "inputs = {}\n");
        let src = r#"
dependency "vpc" {
  config_path  = "../vpc"
  mock_outputs = { id = "vpc-mock" }
  mock_outputs_allowed_terraform_commands = ["plan"]
}

inputs = {
  vpc_id = dependency.vpc.outputs.id
}
"#;
        let path = write_unit(tmp.path(), "app", src);

        let cfg = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap();
        assert_eq!(cfg.inputs["vpc_id"], json!("vpc-mock"));

        let err = evaluator_for(tmp.path(), "apply")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::OutputsUnavailable { .. }));
    }

    #[test]
    fn disabled_dependency_binds_null() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "vpc", "inputs = {}\n");
        let path = write_unit(
            tmp.path(),
            "app",
            r#"
dependency "vpc" {
  config_path = "../vpc"
  enabled     = false
}

inputs = {
  vpc = dependency.vpc
}
"#,
        );
        let cfg = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap();
        assert_eq!(cfg.inputs["vpc"], JsonValue::Null);
    }

    #[test]
    fn feature_flags_default_and_override() {
        let tmp = tempfile::tempdir().unwrap();
        let src = r#"
feature "enable_cdn" {
  default = false
}

inputs = {
  cdn = feature.enable_cdn.value
}
"#;
        let path = write_unit(tmp.path(), "app", src);

        let cfg = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap();
        assert_eq!(cfg.inputs["cdn"], json!(false));

        let mut options = RunOptions::new("plan", tmp.path());
        options
            .features
            .insert("enable_cdn".to_string(), json!(true));
        let evaluator = Evaluator::new(Arc::new(options), Arc::new(RunCmdCache::new()));
        let cfg = evaluator
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap();
        assert_eq!(cfg.inputs["cdn"], json!(true));
    }

    #[test]
    fn partial_mode_skips_sections_that_need_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "vpc", "inputs = {}\n");
        let path = write_unit(
            tmp.path(),
            "app",
            r#"
dependency "vpc" {
  config_path = "../vpc"
}

terraform_binary = "/opt/engines/tofu-1.8"

inputs = {
  vpc_id = dependency.vpc.outputs.id
}
"#,
        );
        let cfg = evaluator_for(tmp.path(), "apply")
            .evaluate_unit(&path, EvalMode::Partial, &BTreeMap::new())
            .unwrap();
        assert_eq!(cfg.dependencies.len(), 1);
        assert!(cfg.inputs.is_empty());
        // Dependents fetch this unit's outputs with its declared engine, so
        // the attribute must already be visible to discovery.
        assert_eq!(
            cfg.terraform_binary,
            Some(PathBuf::from("/opt/engines/tofu-1.8"))
        );
    }

    #[test]
    fn unknown_block_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_unit(tmp.path(), "app", "mystery {\n}\n");
        let err = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("unknown block kind"));
    }

    #[test]
    fn circular_include_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write_unit(tmp.path(), "a", "include \"b\" {\n  path = \"../b/terragrunt.hcl\"\n}\n");
        write_unit(tmp.path(), "b", "include \"a\" {\n  path = \"../a/terragrunt.hcl\"\n}\n");
        let err = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&a, EvalMode::Full, &BTreeMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("circular include chain"));
    }

    #[test]
    fn hooks_and_errors_blocks_decode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_unit(
            tmp.path(),
            "app",
            r#"
terraform {
  source = "./module"

  before_hook "fmt" {
    commands = ["plan", "apply"]
    execute  = ["echo", "before"]
  }

  after_hook "notify" {
    commands     = ["apply"]
    execute      = ["echo", "after"]
    run_on_error = true
  }

  error_hook "capture" {
    commands  = ["apply"]
    execute   = ["echo", "boom"]
    on_errors = [".*"]
  }
}

errors {
  retry "transient" {
    retryable_errors   = [".*TLS handshake.*"]
    max_attempts       = 3
    sleep_interval_sec = 0
  }

  ignore "known_flake" {
    ignorable_errors = [".*already exists.*"]
    message          = "resource pre-created"
    signals = {
      alerted = true
    }
  }
}
"#,
        );
        let cfg = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap();
        assert_eq!(cfg.terraform.before_hook.len(), 1);
        assert_eq!(cfg.terraform.before_hook[0].name, "fmt");
        assert!(cfg.terraform.after_hook[0].run_on_error);
        assert_eq!(cfg.terraform.error_hook[0].on_errors, vec![".*"]);
        assert_eq!(cfg.errors.retries[0].label, "transient");
        assert_eq!(cfg.errors.retries[0].max_attempts, 3);
        assert_eq!(cfg.errors.ignores[0].label, "known_flake");
        assert_eq!(cfg.errors.ignores[0].signals["alerted"], json!(true));
    }

    #[test]
    fn generate_and_remote_state_decode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_unit(
            tmp.path(),
            "app",
            r#"
generate "provider" {
  path      = "provider.tf"
  contents  = "provider \"aws\" {}"
  if_exists = "overwrite_terragrunt"
}

remote_state {
  backend = "s3"
  config = {
    bucket = "state-bucket"
    key    = "app/tfstate"
  }
}
"#,
        );
        let cfg = evaluator_for(tmp.path(), "plan")
            .evaluate_unit(&path, EvalMode::Full, &BTreeMap::new())
            .unwrap();
        let gen = &cfg.generate["provider"];
        assert_eq!(gen.path, "provider.tf");
        assert_eq!(
            gen.if_exists,
            crate::config::model::IfExists::OverwriteTerragrunt
        );
        let rs = cfg.remote_state.as_ref().unwrap();
        assert_eq!(rs.backend, "s3");
        assert_eq!(rs.config["bucket"], json!("state-bucket"));
    }
}
