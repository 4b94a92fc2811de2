//! The exclude engine.
//!
//! A unit is excluded when any `exclude` block whose `if` evaluated true names
//! the current command (or `"all"`) in `actions`. `no_run` additionally turns
//! a single-unit invocation into an early exit with status 0; in multi-unit
//! mode an excluded unit is skipped and never blocks its dependents.

use crate::config::model::ExcludeBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcludeOutcome {
    Run,
    Skip {
        no_run: bool,
        exclude_dependencies: bool,
        exclude_dependents: bool,
    },
}

impl ExcludeOutcome {
    pub fn is_excluded(self) -> bool {
        matches!(self, ExcludeOutcome::Skip { .. })
    }

    /// Early exit applies only in single-unit mode.
    pub fn early_exit(self, run_all: bool) -> bool {
        matches!(self, ExcludeOutcome::Skip { no_run: true, .. }) && !run_all
    }
}

pub fn evaluate(excludes: &[ExcludeBlock], command: &str) -> ExcludeOutcome {
    let matching: Vec<&ExcludeBlock> = excludes.iter().filter(|b| b.matches(command)).collect();
    if matching.is_empty() {
        return ExcludeOutcome::Run;
    }
    ExcludeOutcome::Skip {
        no_run: matching.iter().any(|b| b.no_run),
        exclude_dependencies: matching.iter().any(|b| b.exclude_dependencies),
        exclude_dependents: matching.iter().any(|b| b.exclude_dependents),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block(condition: bool, actions: &[&str], no_run: bool) -> ExcludeBlock {
        serde_json::from_value(json!({
            "if": condition,
            "actions": actions,
            "no_run": no_run,
        }))
        .unwrap()
    }

    #[test]
    fn no_matching_block_runs() {
        assert_eq!(
            evaluate(&[block(true, &["destroy"], false)], "plan"),
            ExcludeOutcome::Run
        );
        assert_eq!(
            evaluate(&[block(false, &["all"], true)], "plan"),
            ExcludeOutcome::Run
        );
    }

    #[test]
    fn all_actions_exclude_any_command() {
        let outcome = evaluate(&[block(true, &["all"], true)], "apply");
        assert!(outcome.is_excluded());
        assert!(outcome.early_exit(false));
        // run --all: no_run behaves like false, unit is just skipped.
        assert!(!outcome.early_exit(true));
    }

    #[test]
    fn propagation_flags_aggregate_across_blocks() {
        let mut deps = block(true, &["plan"], false);
        deps.exclude_dependencies = true;
        let mut dependents = block(true, &["plan"], false);
        dependents.exclude_dependents = true;

        match evaluate(&[deps, dependents], "plan") {
            ExcludeOutcome::Skip {
                exclude_dependencies,
                exclude_dependents,
                ..
            } => {
                assert!(exclude_dependencies);
                assert!(exclude_dependents);
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }
}
