//! `tundra list`: discovered units, one per line.

use tundra_core::error::display_relative;

use crate::cli::args::GlobalArgs;
use crate::cli::commands::discover_tree;
use crate::exit_codes;

pub async fn run(global: &GlobalArgs) -> anyhow::Result<i32> {
    let (options, tree) = discover_tree(global)?;
    let root = options
        .working_dir
        .canonicalize()
        .unwrap_or_else(|_| options.working_dir.clone());
    for unit in tree.units.values() {
        if unit.external {
            continue;
        }
        let mut line = display_relative(&unit.dir, &root);
        if unit.excluded {
            line.push_str(" (excluded)");
        }
        println!("{line}");
    }
    Ok(exit_codes::SUCCESS)
}
