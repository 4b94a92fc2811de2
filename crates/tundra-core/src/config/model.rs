//! Typed configuration model.
//!
//! Blocks are decoded from evaluated HCL into these structs. `BlockKind`
//! carries the fixed evaluation-phase tag the evaluator dispatches on: later
//! phases may reference values produced by earlier ones, never the reverse.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The one recognized configuration filename. A leaf directory containing
/// exactly this file is a unit.
pub const CONFIG_FILENAME: &str = "terragrunt.hcl";

/// Evaluation phases in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvalPhase {
    Feature,
    Include,
    Local,
    Dependency,
    Terraform,
    Inputs,
    Generate,
    RemoteState,
    Errors,
    Exclude,
}

/// Tagged variant over every block kind the configuration language knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Feature,
    Include,
    Locals,
    Dependency,
    Dependencies,
    Terraform,
    Generate,
    RemoteState,
    Errors,
    Exclude,
}

impl BlockKind {
    pub fn from_identifier(ident: &str) -> Option<Self> {
        match ident {
            "feature" => Some(Self::Feature),
            "include" => Some(Self::Include),
            "locals" => Some(Self::Locals),
            "dependency" => Some(Self::Dependency),
            "dependencies" => Some(Self::Dependencies),
            "terraform" => Some(Self::Terraform),
            "generate" => Some(Self::Generate),
            "remote_state" => Some(Self::RemoteState),
            "errors" => Some(Self::Errors),
            "exclude" => Some(Self::Exclude),
            _ => None,
        }
    }

    pub fn phase(self) -> EvalPhase {
        match self {
            Self::Feature => EvalPhase::Feature,
            Self::Include => EvalPhase::Include,
            Self::Locals => EvalPhase::Local,
            Self::Dependency | Self::Dependencies => EvalPhase::Dependency,
            Self::Terraform => EvalPhase::Terraform,
            Self::Generate => EvalPhase::Generate,
            Self::RemoteState => EvalPhase::RemoteState,
            Self::Errors => EvalPhase::Errors,
            Self::Exclude => EvalPhase::Exclude,
        }
    }
}

/// How a parent configuration is folded into its child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Shallow,
    Deep,
    NoMerge,
}

/// How mock outputs combine with partially available real state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMergeStrategy {
    /// Real outputs win entirely.
    #[default]
    NoMerge,
    Shallow,
    DeepMapOnly,
    Deep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeConfig {
    pub label: String,
    pub path: PathBuf,
    pub strategy: MergeStrategy,
    pub expose: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyConfig {
    pub config_path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub skip_outputs: bool,
    #[serde(default)]
    pub mock_outputs: Option<JsonValue>,
    #[serde(default)]
    pub mock_outputs_allowed_terraform_commands: Option<Vec<String>>,
    #[serde(default)]
    pub mock_outputs_merge_strategy_with_state: MockMergeStrategy,
}

impl DependencyConfig {
    /// Mocks are admissible for `command` when an allow-list is absent or
    /// names the command.
    pub fn mocks_allowed_for(&self, command: &str) -> bool {
        self.mock_outputs.is_some()
            && self
                .mock_outputs_allowed_terraform_commands
                .as_ref()
                .map(|cmds| cmds.iter().any(|c| c == command))
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraArguments {
    #[serde(skip)]
    pub name: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub required_var_files: Vec<String>,
    #[serde(default)]
    pub optional_var_files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hook {
    #[serde(skip)]
    pub name: String,
    pub commands: Vec<String>,
    pub execute: Vec<String>,
    #[serde(default)]
    pub run_on_error: bool,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub suppress_stdout: bool,
}

impl Hook {
    pub fn applies_to(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command || c == "all")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorHook {
    #[serde(skip)]
    pub name: String,
    pub commands: Vec<String>,
    pub execute: Vec<String>,
    /// At least one of these regexes must match the engine stderr for the
    /// hook to fire; `.*` matches anything.
    pub on_errors: Vec<String>,
    #[serde(default)]
    pub suppress_stdout: bool,
}

impl ErrorHook {
    pub fn applies_to(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command || c == "all")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerraformBlock {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub extra_arguments: Vec<ExtraArguments>,
    #[serde(default)]
    pub before_hook: Vec<Hook>,
    #[serde(default)]
    pub after_hook: Vec<Hook>,
    #[serde(default)]
    pub error_hook: Vec<ErrorHook>,
    #[serde(default)]
    pub include_in_copy: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_from_copy: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub copy_terraform_lock_file: bool,
}

/// Collision policy for generated files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    #[default]
    Error,
    Overwrite,
    /// Overwrite only files carrying the orchestrator's signature comment.
    OverwriteTerragrunt,
    Skip,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateBlock {
    #[serde(skip)]
    pub name: String,
    pub path: String,
    pub contents: String,
    #[serde(default)]
    pub if_exists: IfExists,
    #[serde(default = "default_comment_prefix")]
    pub comment_prefix: String,
    #[serde(default)]
    pub disable_signature: bool,
    #[serde(default)]
    pub disable: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteStateGenerate {
    pub path: String,
    #[serde(default)]
    pub if_exists: IfExists,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteStateBlock {
    pub backend: String,
    #[serde(default)]
    pub generate: Option<RemoteStateGenerate>,
    #[serde(default)]
    pub config: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub disable_init: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExcludeBlock {
    #[serde(rename = "if", default)]
    pub condition: bool,
    pub actions: Vec<String>,
    #[serde(default)]
    pub no_run: bool,
    #[serde(default)]
    pub exclude_dependencies: bool,
    #[serde(default)]
    pub exclude_dependents: bool,
}

impl ExcludeBlock {
    pub fn matches(&self, command: &str) -> bool {
        self.condition
            && self
                .actions
                .iter()
                .any(|a| a == "all" || a == command)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryRule {
    #[serde(skip)]
    pub label: String,
    pub retryable_errors: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub sleep_interval_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IgnoreRule {
    #[serde(skip)]
    pub label: String,
    pub ignorable_errors: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub signals: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorsConfig {
    pub retries: Vec<RetryRule>,
    pub ignores: Vec<IgnoreRule>,
}

/// Fully evaluated configuration of one unit, includes already merged in.
#[derive(Debug, Clone, Default)]
pub struct UnitConfig {
    pub locals: BTreeMap<String, JsonValue>,
    pub includes: Vec<IncludeConfig>,
    pub dependencies: BTreeMap<String, DependencyConfig>,
    /// Ordering-only edges from a `dependencies { paths = [...] }` block.
    pub ordering_paths: Vec<String>,
    pub terraform: TerraformBlock,
    pub inputs: BTreeMap<String, JsonValue>,
    pub generate: BTreeMap<String, GenerateBlock>,
    pub remote_state: Option<RemoteStateBlock>,
    pub excludes: Vec<ExcludeBlock>,
    pub errors: ErrorsConfig,
    pub features: BTreeMap<String, JsonValue>,
    pub terraform_binary: Option<PathBuf>,
    pub terraform_version_constraint: Option<String>,
    pub skip: bool,
    pub prevent_destroy: bool,
    pub iam_role: Option<String>,
    pub download_dir: Option<PathBuf>,
    /// Resolved outputs per dependency label, bound during full evaluation.
    pub resolved_outputs: BTreeMap<String, JsonValue>,
}

fn default_true() -> bool {
    true
}

fn default_comment_prefix() -> String {
    "# ".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn block_kind_phases_are_ordered() {
        assert!(BlockKind::Feature.phase() < BlockKind::Locals.phase());
        assert!(BlockKind::Locals.phase() < BlockKind::Dependency.phase());
        assert!(BlockKind::Dependency.phase() < BlockKind::Terraform.phase());
        assert!(BlockKind::Terraform.phase() < BlockKind::Exclude.phase());
    }

    #[test]
    fn unknown_identifier_is_not_a_block() {
        assert_eq!(BlockKind::from_identifier("inputs"), None);
        assert_eq!(
            BlockKind::from_identifier("dependency"),
            Some(BlockKind::Dependency)
        );
    }

    #[test]
    fn mocks_allowed_respects_command_allow_list() {
        let dep: DependencyConfig = serde_json::from_value(json!({
            "config_path": "../vpc",
            "mock_outputs": {"id": "mock"},
            "mock_outputs_allowed_terraform_commands": ["plan", "validate"]
        }))
        .unwrap();
        assert!(dep.mocks_allowed_for("plan"));
        assert!(!dep.mocks_allowed_for("apply"));
    }

    #[test]
    fn mocks_without_allow_list_apply_to_any_command() {
        let dep: DependencyConfig = serde_json::from_value(json!({
            "config_path": "../vpc",
            "mock_outputs": {"id": "mock"}
        }))
        .unwrap();
        assert!(dep.mocks_allowed_for("apply"));
    }

    #[test]
    fn exclude_matches_all_or_named_command() {
        let block: ExcludeBlock = serde_json::from_value(json!({
            "if": true,
            "actions": ["all"]
        }))
        .unwrap();
        assert!(block.matches("plan"));

        let block: ExcludeBlock = serde_json::from_value(json!({
            "if": false,
            "actions": ["all"]
        }))
        .unwrap();
        assert!(!block.matches("plan"));

        let block: ExcludeBlock = serde_json::from_value(json!({
            "if": true,
            "actions": ["destroy"]
        }))
        .unwrap();
        assert!(block.matches("destroy"));
        assert!(!block.matches("plan"));
    }

    #[test]
    fn generate_defaults() {
        let block: GenerateBlock = serde_json::from_value(json!({
            "path": "backend.tf",
            "contents": "terraform {}"
        }))
        .unwrap();
        assert_eq!(block.if_exists, IfExists::Error);
        assert_eq!(block.comment_prefix, "# ");
        assert!(!block.disable_signature);
    }
}
