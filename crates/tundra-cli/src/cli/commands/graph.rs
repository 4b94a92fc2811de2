//! `tundra graph`: the unit DAG as DOT on stdout.

use crate::cli::args::GlobalArgs;
use crate::cli::commands::discover_tree;
use crate::exit_codes;

pub async fn run(global: &GlobalArgs) -> anyhow::Result<i32> {
    let (options, tree) = discover_tree(global)?;
    let root = options
        .working_dir
        .canonicalize()
        .unwrap_or_else(|_| options.working_dir.clone());
    print!("{}", tree.dag.to_dot(&root));
    Ok(exit_codes::SUCCESS)
}
