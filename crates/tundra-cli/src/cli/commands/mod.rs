//! Command dispatch and shared run context assembly.

mod find;
mod graph;
mod list;
mod run;

use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use tundra_core::cache::run_cmd::RunCmdCache;
use tundra_core::config::eval::Evaluator;
use tundra_core::discovery::{discover, DiscoveredTree};
use tundra_core::options::{parse_feature_value, RunOptions};

use crate::cli::args::{Cli, Command, GlobalArgs};
use crate::exit_codes;

pub async fn dispatch(cli: Cli) -> i32 {
    let result = match &cli.command {
        Command::Graph => graph::run(&cli.global).await,
        Command::List => list::run(&cli.global).await,
        Command::Find => find::run(&cli.global).await,
        _ => run::run(&cli).await,
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tundra: {e:#}");
            exit_codes::CONFIG_ERROR
        }
    }
}

pub(crate) fn build_options(
    global: &GlobalArgs,
    command: &str,
    engine_args: &[String],
    run_all: bool,
) -> anyhow::Result<RunOptions> {
    let mut options = RunOptions::new(command, &global.working_dir);
    options.engine_args = engine_args.to_vec();
    options.run_all = run_all;
    options.non_interactive = global.non_interactive;
    if let Some(parallelism) = global.parallelism {
        options.parallelism = parallelism.max(1);
    }
    options.include_dirs = global.include_dirs.clone();
    options.exclude_dirs = global.exclude_dirs.clone();
    if let Some(path) = &global.excludes_file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading excludes file {}", path.display()))?;
        options.exclude_dirs.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from),
        );
    }
    options.strict_include = global.queue_strict_include;
    options.ignore_dependency_errors = global.ignore_dependency_errors;
    options.fail_fast = global.fail_fast;
    options.ignore_errors = global.ignore_errors;
    for feature in &global.features {
        let (name, value) = feature
            .split_once('=')
            .ok_or_else(|| anyhow!("--feature expects NAME=VALUE, got {feature:?}"))?;
        options
            .features
            .insert(name.to_string(), parse_feature_value(value));
    }
    options.tf_path = global.tf_path.clone();
    options.include_external = global.include_external;
    options.timeout_secs = global.timeout;
    options.graceful_timeout_secs = global.graceful_timeout;
    options.report_json = global.report_json.clone();
    options.log_prefix = !global.no_unit_prefix;
    Ok(options)
}

/// Discovery-only prelude shared by the inspection commands.
pub(crate) fn discover_tree(
    global: &GlobalArgs,
) -> anyhow::Result<(Arc<RunOptions>, DiscoveredTree)> {
    let options = Arc::new(build_options(global, "plan", &[], true)?);
    let evaluator = Evaluator::new(options.clone(), Arc::new(RunCmdCache::new()));
    let tree = discover(&options, &evaluator)?;
    Ok((options, tree))
}
