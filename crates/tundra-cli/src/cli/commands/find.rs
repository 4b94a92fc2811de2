//! `tundra find`: units with their dependency edges, as JSON lines.

use serde_json::json;
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
        let dependencies: Vec<String> = unit
            .dep_dirs
            .values()
            .chain(unit.ordering_dirs.iter())
            .map(|dir| display_relative(dir, &root))
            .collect();
        let row = json!({
            "path": display_relative(&unit.dir, &root),
            "dependencies": dependencies,
            "external": unit.external,
            "excluded": unit.excluded,
        });
        println!("{row}");
    }
    Ok(exit_codes::SUCCESS)
}
