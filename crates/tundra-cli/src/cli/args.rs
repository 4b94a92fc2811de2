//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Clone)]
#[command(
    name = "tundra",
    version,
    about = "Run OpenTofu/Terraform across a tree of configuration units"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Clone)]
pub struct GlobalArgs {
    /// Root of discovery; single-unit commands run the unit in this directory.
    #[arg(long, global = true, default_value = ".")]
    pub working_dir: PathBuf,

    /// Answer every prompt with yes and never block on stdin.
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Concurrency ceiling for engine subprocesses (default: logical CPUs).
    #[arg(long, global = true)]
    pub parallelism: Option<usize>,

    /// Only discover units under these directories (repeatable, globs).
    #[arg(long = "include-dir", global = true)]
    pub include_dirs: Vec<String>,

    /// Skip units under these directories (repeatable, globs).
    #[arg(long = "exclude-dir", global = true)]
    pub exclude_dirs: Vec<String>,

    /// File of exclude globs, one per line; `#` starts a comment.
    #[arg(long, global = true)]
    pub excludes_file: Option<PathBuf>,

    /// With --include-dir, schedule only the matches, not their dependencies.
    #[arg(long, global = true)]
    pub queue_strict_include: bool,

    /// Do not halt dependents when a dependency fails.
    #[arg(long, global = true)]
    pub ignore_dependency_errors: bool,

    /// Cancel everything at the first unit failure.
    #[arg(long, global = true)]
    pub fail_fast: bool,

    /// Exit 0 even when units fail.
    #[arg(long, global = true)]
    pub ignore_errors: bool,

    /// Override a feature flag default, as name=value (repeatable).
    #[arg(long = "feature", global = true, value_name = "NAME=VALUE")]
    pub features: Vec<String>,

    /// Absolute path to the engine binary, overriding any `terraform_binary`
    /// attribute in configuration.
    #[arg(long, global = true)]
    pub tf_path: Option<PathBuf>,

    /// Schedule external dependencies instead of fetching their outputs only.
    #[arg(long, global = true)]
    pub include_external: bool,

    /// Deadline in seconds for each engine invocation.
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Grace period in seconds between SIGTERM and SIGKILL on shutdown.
    #[arg(long, global = true, default_value_t = 5, value_name = "SECS")]
    pub graceful_timeout: u64,

    /// Write the structured run report to this path as JSON.
    #[arg(long, global = true, value_name = "PATH")]
    pub report_json: Option<PathBuf>,

    /// Do not prefix streamed lines with the unit's relative path.
    #[arg(long, global = true)]
    pub no_unit_prefix: bool,
}

#[derive(Args, Clone, Default)]
pub struct EngineArgs {
    /// Extra arguments passed through to the engine binary.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Subcommand, Clone)]
pub enum Command {
    /// Show the changes the engine would make for this unit.
    Plan(EngineArgs),
    /// Apply this unit.
    Apply(EngineArgs),
    /// Destroy this unit.
    Destroy(EngineArgs),
    /// Print this unit's outputs.
    Output(EngineArgs),
    /// Validate this unit's engine configuration.
    Validate(EngineArgs),
    /// Initialize this unit's working directory.
    Init(EngineArgs),
    /// Show this unit's state or plan file.
    Show(EngineArgs),
    /// Print the unit dependency graph as DOT.
    Graph,
    /// List discovered units.
    List,
    /// Print discovered units with their dependencies as JSON lines.
    Find,
    /// Run an engine command across every unit in dependency order.
    RunAll {
        /// Engine subcommand to run (plan, apply, destroy, ...).
        command: String,
        /// Extra arguments passed through to the engine binary.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Command {
    /// Engine subcommand name, and whether this is the multi-unit form.
    pub fn engine_command(&self) -> Option<(&str, &[String], bool)> {
        match self {
            Command::Plan(a) => Some(("plan", &a.args, false)),
            Command::Apply(a) => Some(("apply", &a.args, false)),
            Command::Destroy(a) => Some(("destroy", &a.args, false)),
            Command::Output(a) => Some(("output", &a.args, false)),
            Command::Validate(a) => Some(("validate", &a.args, false)),
            Command::Init(a) => Some(("init", &a.args, false)),
            Command::Show(a) => Some(("show", &a.args, false)),
            Command::RunAll { command, args } => Some((command, args, true)),
            Command::Graph | Command::List | Command::Find => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_all_with_passthrough_args() {
        let cli = Cli::parse_from([
            "tundra",
            "--working-dir",
            "/stack",
            "--parallelism",
            "8",
            "run-all",
            "apply",
            "-target=module.db",
        ]);
        assert_eq!(cli.global.parallelism, Some(8));
        let (cmd, args, run_all) = cli.command.engine_command().unwrap();
        assert_eq!(cmd, "apply");
        assert_eq!(args, ["-target=module.db"]);
        assert!(run_all);
    }

    #[test]
    fn parses_single_unit_plan_with_flags_after_subcommand() {
        let cli = Cli::parse_from(["tundra", "plan", "--working-dir", "/stack/app"]);
        assert_eq!(cli.global.working_dir, PathBuf::from("/stack/app"));
        let (cmd, _, run_all) = cli.command.engine_command().unwrap();
        assert_eq!(cmd, "plan");
        assert!(!run_all);
    }

    #[test]
    fn feature_overrides_are_repeatable() {
        let cli = Cli::parse_from([
            "tundra",
            "--feature",
            "cdn=true",
            "--feature",
            "replicas=3",
            "plan",
        ]);
        assert_eq!(cli.global.features, ["cdn=true", "replicas=3"]);
    }

    #[test]
    fn inspection_commands_have_no_engine_command() {
        let cli = Cli::parse_from(["tundra", "graph"]);
        assert!(cli.command.engine_command().is_none());
    }
}
