//! Unit discovery and graph assembly.
//!
//! Walks the working directory for unit configuration files, partially parses
//! each one just enough to extract dependency edges, applies CLI filters and
//! per-unit exclude policy, and builds the DAG. Everything here is fatal:
//! discovery errors abort the run before any engine invocation.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::Glob;
use petgraph::Direction;
use tracing::{debug, warn};

use crate::config::eval::{EvalMode, Evaluator};
use crate::config::model::{UnitConfig, CONFIG_FILENAME};
use crate::dag::Dag;
use crate::error::{display_relative, Error, Result};
use crate::options::{RunOptions, CACHE_DIR};
use crate::policy::exclude::{self, ExcludeOutcome};

#[derive(Debug)]
pub struct DiscoveredUnit {
    pub dir: PathBuf,
    pub config_path: PathBuf,
    /// Partially evaluated configuration (edges, exclusion, skip).
    pub config: UnitConfig,
    /// Dependency label -> canonical dependency directory.
    pub dep_dirs: BTreeMap<String, PathBuf>,
    /// Ordering-only edges from `dependencies { paths }`.
    pub ordering_dirs: Vec<PathBuf>,
    /// Outside the working root; fetch-only unless `--include-external`.
    pub external: bool,
    /// Terminal before scheduling; dependents do not wait for it.
    pub excluded: bool,
    /// Outcome of the unit's own exclude blocks.
    pub exclusion: ExcludeOutcome,
}

#[derive(Debug)]
pub struct DiscoveredTree {
    pub units: BTreeMap<PathBuf, DiscoveredUnit>,
    pub dag: Dag,
}

impl DiscoveredTree {
    /// Units that will actually be scheduled.
    pub fn scheduled(&self) -> impl Iterator<Item = &DiscoveredUnit> {
        self.units.values().filter(|u| !u.excluded)
    }
}

pub fn discover(options: &Arc<RunOptions>, evaluator: &Evaluator) -> Result<DiscoveredTree> {
    let root = options
        .working_dir
        .canonicalize()
        .map_err(|e| Error::DirWalk {
            path: options.working_dir.clone(),
            source: e,
        })?;

    let mut candidates = Vec::new();
    walk(&root, &mut candidates)?;
    candidates.sort();
    debug!(count = candidates.len(), root = %root.display(), "discovered candidate units");

    let mut units: BTreeMap<PathBuf, DiscoveredUnit> = BTreeMap::new();
    let mut dag = Dag::new();
    let mut pending_external: VecDeque<PathBuf> = VecDeque::new();

    for dir in candidates {
        let unit = parse_unit(&root, &dir, evaluator, options, &mut pending_external)?;
        add_edges(&mut dag, &unit);
        units.insert(dir, unit);
    }

    // External dependencies become graph nodes. With --include-external they
    // are parsed and scheduled like any other unit, which may pull in further
    // externals; otherwise they stay fetch-only.
    let mut seen_external: BTreeSet<PathBuf> = BTreeSet::new();
    while let Some(dir) = pending_external.pop_front() {
        if units.contains_key(&dir) || !seen_external.insert(dir.clone()) {
            continue;
        }
        if options.include_external && dir.join(CONFIG_FILENAME).is_file() {
            let unit = parse_unit(&root, &dir, evaluator, options, &mut pending_external)?;
            add_edges(&mut dag, &unit);
            units.insert(dir, unit);
        } else {
            dag.add_unit(&dir);
            units.insert(
                dir.clone(),
                DiscoveredUnit {
                    config_path: dir.join(CONFIG_FILENAME),
                    dir,
                    config: UnitConfig::default(),
                    dep_dirs: BTreeMap::new(),
                    ordering_dirs: Vec::new(),
                    external: true,
                    excluded: true,
                    exclusion: ExcludeOutcome::Run,
                },
            );
        }
    }

    dag.check_acyclic()?;
    check_duplicate_workdirs(options, &units)?;
    apply_exclusions(options, &root, &mut units, &dag)?;

    Ok(DiscoveredTree { units, dag })
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::DirWalk {
        path: dir.to_path_buf(),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::DirWalk {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if entry
            .file_type()
            .map_err(|e| Error::DirWalk {
                path: path.clone(),
                source: e,
            })?
            .is_dir()
        {
            if name.starts_with('.') || name == CACHE_DIR || name == ".terraform" {
                continue;
            }
            walk(&path, out)?;
        } else if name == CONFIG_FILENAME {
            out.push(dir.to_path_buf());
        }
    }
    Ok(())
}

fn parse_unit(
    root: &Path,
    dir: &Path,
    evaluator: &Evaluator,
    options: &Arc<RunOptions>,
    pending_external: &mut VecDeque<PathBuf>,
) -> Result<DiscoveredUnit> {
    let config_path = dir.join(CONFIG_FILENAME);
    let config = evaluator.evaluate_unit(&config_path, EvalMode::Partial, &BTreeMap::new())?;

    let mut dep_dirs = BTreeMap::new();
    for (label, dep) in &config.dependencies {
        let target = resolve_dep_dir(dir, &config_path, label, &dep.config_path)?;
        if !target.starts_with(root) {
            pending_external.push_back(target.clone());
        }
        dep_dirs.insert(label.clone(), target);
    }

    let mut ordering_dirs = Vec::new();
    for raw in &config.ordering_paths {
        let target = resolve_dep_dir(dir, &config_path, "paths", raw)?;
        if !target.starts_with(root) {
            pending_external.push_back(target.clone());
        }
        ordering_dirs.push(target);
    }

    let exclusion = exclude::evaluate(&config.excludes, &options.command);
    let excluded = exclusion.is_excluded() || config.skip;
    if config.skip {
        warn!(unit = %display_relative(dir, root), "unit sets skip = true");
    }

    Ok(DiscoveredUnit {
        dir: dir.to_path_buf(),
        config_path,
        config,
        dep_dirs,
        ordering_dirs,
        external: !dir.starts_with(root),
        excluded,
        exclusion,
    })
}

pub(crate) fn resolve_dep_dir(
    unit_dir: &Path,
    config_path: &Path,
    label: &str,
    raw: &str,
) -> Result<PathBuf> {
    let target = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        unit_dir.join(raw)
    };
    let target = target.canonicalize().map_err(|_| Error::UnknownDependency {
        path: config_path.to_path_buf(),
        label: label.to_string(),
        target,
    })?;
    if !target.join(CONFIG_FILENAME).is_file() {
        return Err(Error::UnknownDependency {
            path: config_path.to_path_buf(),
            label: label.to_string(),
            target,
        });
    }
    Ok(target)
}

fn add_edges(dag: &mut Dag, unit: &DiscoveredUnit) {
    dag.add_unit(&unit.dir);
    for dep in unit.dep_dirs.values() {
        dag.add_edge(dep, &unit.dir);
    }
    for dep in &unit.ordering_dirs {
        dag.add_edge(dep, &unit.dir);
    }
}

fn check_duplicate_workdirs(
    options: &Arc<RunOptions>,
    units: &BTreeMap<PathBuf, DiscoveredUnit>,
) -> Result<()> {
    let mut seen: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    for unit in units.values() {
        if unit.external {
            continue;
        }
        let work_dir = crate::runner::workdir::work_dir_for(options, &unit.dir, &unit.config);
        if let Some(first) = seen.get(&work_dir) {
            return Err(Error::DuplicateWorkingDir {
                first: first.clone(),
                second: unit.dir.clone(),
                dir: work_dir,
            });
        }
        seen.insert(work_dir, unit.dir.clone());
    }
    Ok(())
}

fn build_matcher(patterns: &[String]) -> Result<Vec<globset::GlobMatcher>> {
    let mut out = Vec::with_capacity(patterns.len() * 2);
    for pattern in patterns {
        let trimmed = pattern.trim_end_matches('/');
        for candidate in [trimmed.to_string(), format!("{trimmed}/**")] {
            out.push(
                Glob::new(&candidate)
                    .map_err(|e| Error::Other(format!("bad filter glob {pattern:?}: {e}")))?
                    .compile_matcher(),
            );
        }
    }
    Ok(out)
}

fn matches(matchers: &[globset::GlobMatcher], rel: &str) -> bool {
    matchers.iter().any(|m| m.is_match(rel))
}

/// CLI filters plus per-unit propagation flags, in order: direct marks,
/// downstream (`exclude_dependents`), then upstream (`exclude_dependencies`,
/// sparing anything a surviving unit still needs).
fn apply_exclusions(
    options: &Arc<RunOptions>,
    root: &Path,
    units: &mut BTreeMap<PathBuf, DiscoveredUnit>,
    dag: &Dag,
) -> Result<()> {
    let include = build_matcher(&options.include_dirs)?;
    let exclude = build_matcher(&options.exclude_dirs)?;

    if !include.is_empty() {
        let wanted: Vec<PathBuf> = units
            .values()
            .filter(|u| !u.external && matches(&include, &display_relative(&u.dir, root)))
            .map(|u| u.dir.clone())
            .collect();
        let mut keep: HashSet<PathBuf> = wanted.iter().cloned().collect();
        if !options.strict_include {
            let starts: Vec<_> = wanted.iter().filter_map(|d| dag.node(d)).collect();
            for ix in dag.transitive(&starts, Direction::Incoming) {
                keep.insert(dag.dir(ix).clone());
            }
        }
        for unit in units.values_mut() {
            if !unit.external && !keep.contains(&unit.dir) {
                unit.excluded = true;
            }
        }
    }
    for unit in units.values_mut() {
        if !unit.external && matches(&exclude, &display_relative(&unit.dir, root)) {
            unit.excluded = true;
        }
    }

    // Downstream propagation.
    let dependent_roots: Vec<_> = units
        .values()
        .filter(|u| {
            matches!(
                u.exclusion,
                ExcludeOutcome::Skip {
                    exclude_dependents: true,
                    ..
                }
            )
        })
        .filter_map(|u| dag.node(&u.dir))
        .collect();
    for ix in dag.transitive(&dependent_roots, Direction::Outgoing) {
        if let Some(unit) = units.get_mut(dag.dir(ix)) {
            unit.excluded = true;
        }
    }

    // Upstream propagation: dependencies of flagged units are dropped unless
    // some surviving unit still needs them.
    let dependency_roots: Vec<_> = units
        .values()
        .filter(|u| {
            matches!(
                u.exclusion,
                ExcludeOutcome::Skip {
                    exclude_dependencies: true,
                    ..
                }
            )
        })
        .filter_map(|u| dag.node(&u.dir))
        .collect();
    if !dependency_roots.is_empty() {
        let candidates = dag.transitive(&dependency_roots, Direction::Incoming);
        let survivors: Vec<_> = units
            .values()
            .filter(|u| !u.excluded)
            .filter_map(|u| dag.node(&u.dir))
            .filter(|ix| !candidates.contains(ix))
            .collect();
        let mut needed: HashSet<_> = dag.transitive(&survivors, Direction::Incoming);
        needed.extend(survivors);
        for ix in candidates {
            if !needed.contains(&ix) {
                if let Some(unit) = units.get_mut(dag.dir(ix)) {
                    unit.excluded = true;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::run_cmd::RunCmdCache;
    use std::fs;

    fn write_unit(root: &Path, rel: &str, contents: &str) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CONFIG_FILENAME), contents).unwrap();
    }

    fn discover_with(root: &Path, f: impl FnOnce(&mut RunOptions)) -> Result<DiscoveredTree> {
        let mut options = RunOptions::new("plan", root);
        options.run_all = true;
        f(&mut options);
        let options = Arc::new(options);
        let evaluator = Evaluator::new(options.clone(), Arc::new(RunCmdCache::new()));
        discover(&options, &evaluator)
    }

    #[test]
    fn finds_units_and_builds_edges() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "vpc", "inputs = {}\n");
        write_unit(
            tmp.path(),
            "app",
            "dependency \"vpc\" {\n  config_path = \"../vpc\"\n}\n",
        );
        let tree = discover_with(tmp.path(), |_| {}).unwrap();
        assert_eq!(tree.units.len(), 2);
        let app = tree
            .units
            .values()
            .find(|u| u.dir.ends_with("app"))
            .unwrap();
        assert_eq!(app.dep_dirs.len(), 1);
        assert!(app.dep_dirs["vpc"].ends_with("vpc"));
    }

    #[test]
    fn hidden_and_cache_dirs_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "app", "inputs = {}\n");
        write_unit(tmp.path(), ".hidden/unit", "inputs = {}\n");
        write_unit(tmp.path(), &format!("{CACHE_DIR}/unit"), "inputs = {}\n");
        let tree = discover_with(tmp.path(), |_| {}).unwrap();
        assert_eq!(tree.units.len(), 1);
    }

    #[test]
    fn cycle_is_fatal_with_path() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(
            tmp.path(),
            "a",
            "dependency \"b\" {\n  config_path = \"../b\"\n}\n",
        );
        write_unit(
            tmp.path(),
            "b",
            "dependency \"a\" {\n  config_path = \"../a\"\n}\n",
        );
        let err = discover_with(tmp.path(), |_| {}).unwrap_err();
        match err {
            Error::Cycle(cycle) => assert_eq!(cycle.first(), cycle.last()),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn missing_dependency_dir_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(
            tmp.path(),
            "app",
            "dependency \"ghost\" {\n  config_path = \"../ghost\"\n}\n",
        );
        let err = discover_with(tmp.path(), |_| {}).unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { .. }));
    }

    #[test]
    fn external_dependency_is_fetch_only_by_default() {
        let outside = tempfile::tempdir().unwrap();
        write_unit(outside.path(), "shared", "inputs = {}\n");
        let tmp = tempfile::tempdir().unwrap();
        write_unit(
            tmp.path(),
            "app",
            &format!(
                "dependency \"shared\" {{\n  config_path = \"{}\"\n}}\n",
                outside.path().join("shared").display()
            ),
        );
        let tree = discover_with(tmp.path(), |_| {}).unwrap();
        let external = tree.units.values().find(|u| u.external).unwrap();
        assert!(external.excluded);

        let tree = discover_with(tmp.path(), |o| o.include_external = true).unwrap();
        let external = tree.units.values().find(|u| u.external).unwrap();
        assert!(!external.excluded);
    }

    #[test]
    fn ordering_paths_create_edges_without_labels() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "first", "inputs = {}\n");
        write_unit(
            tmp.path(),
            "second",
            "dependencies {\n  paths = [\"../first\"]\n}\n",
        );
        let tree = discover_with(tmp.path(), |_| {}).unwrap();
        let second = tree
            .units
            .values()
            .find(|u| u.dir.ends_with("second"))
            .unwrap();
        assert!(second.dep_dirs.is_empty());
        assert_eq!(second.ordering_dirs.len(), 1);
        let ix = tree.dag.node(&second.dir).unwrap();
        assert_eq!(tree.dag.dependencies_of(ix).len(), 1);
    }

    #[test]
    fn include_and_exclude_dir_filters() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "keep/app", "inputs = {}\n");
        write_unit(tmp.path(), "drop/app", "inputs = {}\n");

        let tree = discover_with(tmp.path(), |o| o.include_dirs = vec!["keep".into()]).unwrap();
        let keep = tree.units.values().find(|u| u.dir.ends_with("keep/app")).unwrap();
        let drop = tree.units.values().find(|u| u.dir.ends_with("drop/app")).unwrap();
        assert!(!keep.excluded);
        assert!(drop.excluded);

        let tree = discover_with(tmp.path(), |o| o.exclude_dirs = vec!["drop".into()]).unwrap();
        let drop = tree.units.values().find(|u| u.dir.ends_with("drop/app")).unwrap();
        assert!(drop.excluded);
    }

    #[test]
    fn non_strict_include_keeps_dependencies() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "base/vpc", "inputs = {}\n");
        write_unit(
            tmp.path(),
            "apps/web",
            "dependency \"vpc\" {\n  config_path = \"../../base/vpc\"\n}\n",
        );
        let tree = discover_with(tmp.path(), |o| o.include_dirs = vec!["apps".into()]).unwrap();
        let vpc = tree.units.values().find(|u| u.dir.ends_with("vpc")).unwrap();
        assert!(!vpc.excluded, "dependency of an included unit must stay");

        let tree = discover_with(tmp.path(), |o| {
            o.include_dirs = vec!["apps".into()];
            o.strict_include = true;
        })
        .unwrap();
        let vpc = tree.units.values().find(|u| u.dir.ends_with("vpc")).unwrap();
        assert!(vpc.excluded, "strict include schedules only matches");
    }

    #[test]
    fn exclude_dependents_propagates_downstream() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(
            tmp.path(),
            "vpc",
            r#"
exclude {
  if                 = true
  actions            = ["all"]
  exclude_dependents = true
}
"#,
        );
        write_unit(
            tmp.path(),
            "app",
            "dependency \"vpc\" {\n  config_path = \"../vpc\"\n}\n",
        );
        let tree = discover_with(tmp.path(), |_| {}).unwrap();
        assert!(tree.units.values().all(|u| u.excluded));
    }

    #[test]
    fn exclude_dependencies_spares_shared_deps() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "shared", "inputs = {}\n");
        write_unit(tmp.path(), "solo", "inputs = {}\n");
        write_unit(
            tmp.path(),
            "gone",
            r#"
dependency "shared" {
  config_path = "../shared"
}

dependency "solo" {
  config_path = "../solo"
}

exclude {
  if                   = true
  actions              = ["all"]
  exclude_dependencies = true
}
"#,
        );
        write_unit(
            tmp.path(),
            "stays",
            "dependency \"shared\" {\n  config_path = \"../shared\"\n}\n",
        );
        let tree = discover_with(tmp.path(), |_| {}).unwrap();
        let unit = |name: &str| tree.units.values().find(|u| u.dir.ends_with(name)).unwrap();
        assert!(unit("gone").excluded);
        assert!(unit("solo").excluded, "only the excluded unit needed it");
        assert!(!unit("shared").excluded, "a surviving dependent needs it");
        assert!(!unit("stays").excluded);
    }

    #[test]
    fn duplicate_workdir_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = tmp.path().join("shared-work");
        fs::create_dir_all(tmp.path().join("a/module")).unwrap();
        fs::create_dir_all(tmp.path().join("b/module")).unwrap();
        let cfg = |dir: &Path| {
            format!(
                "terraform {{\n  source = \"./module\"\n}}\n\ndownload_dir = \"{}\"\n",
                dir.display()
            )
        };
        write_unit(tmp.path(), "a", &cfg(&shared));
        write_unit(tmp.path(), "b", &cfg(&shared));
        let err = discover_with(tmp.path(), |_| {}).unwrap_err();
        assert!(matches!(err, Error::DuplicateWorkingDir { .. }));
    }
}
