//! Merge semantics for includes and mock outputs.
//!
//! Parent-into-child rules:
//! - shallow: a child-declared attribute or block replaces the parent's of the
//!   same name wholesale; undeclared ones are inherited verbatim. Lists are
//!   never concatenated.
//! - deep: mappings merge recursively, lists concatenate parent-first,
//!   primitives child-wins.
//! - no_merge: nothing is folded in; the parent is only visible through
//!   `expose`.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use super::model::{MergeStrategy, MockMergeStrategy, TerraformBlock, UnitConfig};

/// Recursive child-over-parent merge of JSON values.
pub fn deep_merge_json(parent: &JsonValue, child: &JsonValue) -> JsonValue {
    match (parent, child) {
        (JsonValue::Object(p), JsonValue::Object(c)) => {
            let mut out = p.clone();
            for (k, cv) in c {
                let merged = match out.get(k) {
                    Some(pv) => deep_merge_json(pv, cv),
                    None => cv.clone(),
                };
                out.insert(k.clone(), merged);
            }
            JsonValue::Object(out)
        }
        (JsonValue::Array(p), JsonValue::Array(c)) => {
            let mut out = p.clone();
            out.extend(c.iter().cloned());
            JsonValue::Array(out)
        }
        (_, c) => c.clone(),
    }
}

fn merge_value_maps(
    parent: &BTreeMap<String, JsonValue>,
    child: &BTreeMap<String, JsonValue>,
    strategy: MergeStrategy,
) -> BTreeMap<String, JsonValue> {
    let mut out = parent.clone();
    for (k, cv) in child {
        let merged = match (strategy, out.get(k)) {
            (MergeStrategy::Deep, Some(pv)) => deep_merge_json(pv, cv),
            _ => cv.clone(),
        };
        out.insert(k.clone(), merged);
    }
    out
}

fn merge_terraform(
    parent: &TerraformBlock,
    child: &TerraformBlock,
    strategy: MergeStrategy,
) -> TerraformBlock {
    let deep = strategy == MergeStrategy::Deep;
    let mut out = child.clone();

    if out.source.is_none() {
        out.source = parent.source.clone();
    }
    match strategy {
        MergeStrategy::Shallow => {
            // Child-declared lists replace the parent's wholesale.
            if out.extra_arguments.is_empty() {
                out.extra_arguments = parent.extra_arguments.clone();
            }
            if out.before_hook.is_empty() {
                out.before_hook = parent.before_hook.clone();
            }
            if out.after_hook.is_empty() {
                out.after_hook = parent.after_hook.clone();
            }
            if out.error_hook.is_empty() {
                out.error_hook = parent.error_hook.clone();
            }
            if out.include_in_copy.is_none() {
                out.include_in_copy = parent.include_in_copy.clone();
            }
            if out.exclude_from_copy.is_none() {
                out.exclude_from_copy = parent.exclude_from_copy.clone();
            }
        }
        MergeStrategy::Deep => {}
        MergeStrategy::NoMerge => unreachable!("no_merge handled by caller"),
    }
    if deep {
        let mut extra = parent.extra_arguments.clone();
        extra.extend(child.extra_arguments.clone());
        out.extra_arguments = extra;

        let mut before = parent.before_hook.clone();
        before.extend(child.before_hook.clone());
        out.before_hook = before;

        let mut after = parent.after_hook.clone();
        after.extend(child.after_hook.clone());
        out.after_hook = after;

        let mut error = parent.error_hook.clone();
        error.extend(child.error_hook.clone());
        out.error_hook = error;

        out.include_in_copy = concat_opt_lists(&parent.include_in_copy, &child.include_in_copy);
        out.exclude_from_copy = concat_opt_lists(&parent.exclude_from_copy, &child.exclude_from_copy);
    }
    out
}

fn concat_opt_lists(
    parent: &Option<Vec<String>>,
    child: &Option<Vec<String>>,
) -> Option<Vec<String>> {
    match (parent, child) {
        (None, None) => None,
        (Some(p), None) => Some(p.clone()),
        (None, Some(c)) => Some(c.clone()),
        (Some(p), Some(c)) => {
            let mut out = p.clone();
            out.extend(c.iter().cloned());
            Some(out)
        }
    }
}

/// Fold an evaluated parent configuration into an evaluated child per the
/// include's strategy. The child always wins conflicts.
pub fn merge_configs(parent: &UnitConfig, child: UnitConfig, strategy: MergeStrategy) -> UnitConfig {
    if strategy == MergeStrategy::NoMerge {
        return child;
    }

    let mut out = child;

    out.locals = merge_value_maps(&parent.locals, &out.locals, strategy);
    out.inputs = merge_value_maps(&parent.inputs, &out.inputs, strategy);
    out.features = merge_value_maps(&parent.features, &out.features, strategy);

    for (label, dep) in &parent.dependencies {
        out.dependencies
            .entry(label.clone())
            .or_insert_with(|| dep.clone());
    }
    for (name, gen) in &parent.generate {
        out.generate
            .entry(name.clone())
            .or_insert_with(|| gen.clone());
    }

    if strategy == MergeStrategy::Deep {
        let mut paths = parent.ordering_paths.clone();
        paths.extend(out.ordering_paths.clone());
        paths.dedup();
        out.ordering_paths = paths;

        let mut retries = parent.errors.retries.clone();
        retries.extend(out.errors.retries.clone());
        out.errors.retries = retries;
        let mut ignores = parent.errors.ignores.clone();
        ignores.extend(out.errors.ignores.clone());
        out.errors.ignores = ignores;

        let mut excludes = parent.excludes.clone();
        excludes.extend(out.excludes.clone());
        out.excludes = excludes;
    } else {
        if out.ordering_paths.is_empty() {
            out.ordering_paths = parent.ordering_paths.clone();
        }
        if out.errors.retries.is_empty() {
            out.errors.retries = parent.errors.retries.clone();
        }
        if out.errors.ignores.is_empty() {
            out.errors.ignores = parent.errors.ignores.clone();
        }
        if out.excludes.is_empty() {
            out.excludes = parent.excludes.clone();
        }
    }

    out.terraform = merge_terraform(&parent.terraform, &out.terraform, strategy);

    if out.remote_state.is_none() {
        out.remote_state = parent.remote_state.clone();
    }
    if out.terraform_binary.is_none() {
        out.terraform_binary = parent.terraform_binary.clone();
    }
    if out.terraform_version_constraint.is_none() {
        out.terraform_version_constraint = parent.terraform_version_constraint.clone();
    }
    if out.iam_role.is_none() {
        out.iam_role = parent.iam_role.clone();
    }
    if out.download_dir.is_none() {
        out.download_dir = parent.download_dir.clone();
    }
    out.skip = out.skip || parent.skip;
    out.prevent_destroy = out.prevent_destroy || parent.prevent_destroy;

    out
}

/// Overlay real (possibly partial) outputs onto mock outputs per the declared
/// strategy. `no_merge` means the real outputs win entirely.
pub fn merge_mock_with_state(
    mock: &JsonValue,
    real: &JsonValue,
    strategy: MockMergeStrategy,
) -> JsonValue {
    match strategy {
        MockMergeStrategy::NoMerge => real.clone(),
        MockMergeStrategy::Shallow => match (mock, real) {
            (JsonValue::Object(m), JsonValue::Object(r)) => {
                let mut out = m.clone();
                for (k, v) in r {
                    out.insert(k.clone(), v.clone());
                }
                JsonValue::Object(out)
            }
            _ => real.clone(),
        },
        MockMergeStrategy::DeepMapOnly => overlay(mock, real, false),
        MockMergeStrategy::Deep => overlay(mock, real, true),
    }
}

fn overlay(base: &JsonValue, over: &JsonValue, concat_lists: bool) -> JsonValue {
    match (base, over) {
        (JsonValue::Object(b), JsonValue::Object(o)) => {
            let mut out = b.clone();
            for (k, ov) in o {
                let merged = match out.get(k) {
                    Some(bv) => overlay(bv, ov, concat_lists),
                    None => ov.clone(),
                };
                out.insert(k.clone(), merged);
            }
            JsonValue::Object(out)
        }
        (JsonValue::Array(b), JsonValue::Array(o)) if concat_lists => {
            let mut out = b.clone();
            out.extend(o.iter().cloned());
            JsonValue::Array(out)
        }
        (_, o) => o.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tf_with_exclude(items: &[&str]) -> TerraformBlock {
        TerraformBlock {
            exclude_from_copy: Some(items.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn shallow_replaces_copy_filters_entirely() {
        let parent = UnitConfig {
            terraform: tf_with_exclude(&["p"]),
            ..Default::default()
        };
        let child = UnitConfig {
            terraform: tf_with_exclude(&["c"]),
            ..Default::default()
        };
        let merged = merge_configs(&parent, child, MergeStrategy::Shallow);
        assert_eq!(merged.terraform.exclude_from_copy, Some(vec!["c".into()]));
    }

    #[test]
    fn shallow_inherits_undeclared_copy_filters_verbatim() {
        let parent = UnitConfig {
            terraform: tf_with_exclude(&["p"]),
            ..Default::default()
        };
        let child = UnitConfig::default();
        let merged = merge_configs(&parent, child, MergeStrategy::Shallow);
        assert_eq!(merged.terraform.exclude_from_copy, Some(vec!["p".into()]));
    }

    #[test]
    fn deep_concatenates_copy_filters_parent_first() {
        let parent = UnitConfig {
            terraform: tf_with_exclude(&["p"]),
            ..Default::default()
        };
        let child = UnitConfig {
            terraform: tf_with_exclude(&["c"]),
            ..Default::default()
        };
        let merged = merge_configs(&parent, child, MergeStrategy::Deep);
        assert_eq!(
            merged.terraform.exclude_from_copy,
            Some(vec!["p".into(), "c".into()])
        );
    }

    #[test]
    fn inputs_merge_keywise_child_wins() {
        let mut parent = UnitConfig::default();
        parent.inputs.insert("region".into(), json!("eu-west-1"));
        parent.inputs.insert("size".into(), json!("m5.large"));
        let mut child = UnitConfig::default();
        child.inputs.insert("region".into(), json!("us-east-1"));

        let merged = merge_configs(&parent, child, MergeStrategy::Shallow);
        assert_eq!(merged.inputs["region"], json!("us-east-1"));
        assert_eq!(merged.inputs["size"], json!("m5.large"));
    }

    #[test]
    fn deep_merges_nested_input_maps() {
        let mut parent = UnitConfig::default();
        parent
            .inputs
            .insert("tags".into(), json!({"team": "infra", "env": "dev"}));
        let mut child = UnitConfig::default();
        child.inputs.insert("tags".into(), json!({"env": "prod"}));

        let merged = merge_configs(&parent, child, MergeStrategy::Deep);
        assert_eq!(
            merged.inputs["tags"],
            json!({"team": "infra", "env": "prod"})
        );
    }

    #[test]
    fn no_merge_keeps_child_untouched() {
        let mut parent = UnitConfig::default();
        parent.inputs.insert("region".into(), json!("eu-west-1"));
        let child = UnitConfig::default();
        let merged = merge_configs(&parent, child, MergeStrategy::NoMerge);
        assert!(merged.inputs.is_empty());
    }

    #[test]
    fn mock_no_merge_real_wins_entirely() {
        let mock = json!({"id": "mock", "extra": 1});
        let real = json!({"id": "real"});
        assert_eq!(
            merge_mock_with_state(&mock, &real, MockMergeStrategy::NoMerge),
            real
        );
    }

    #[test]
    fn mock_shallow_fills_missing_top_level_keys() {
        let mock = json!({"id": "mock", "extra": "kept"});
        let real = json!({"id": "real"});
        assert_eq!(
            merge_mock_with_state(&mock, &real, MockMergeStrategy::Shallow),
            json!({"id": "real", "extra": "kept"})
        );
    }

    #[test]
    fn mock_deep_concatenates_lists_deep_map_only_replaces() {
        let mock = json!({"subnets": ["a"]});
        let real = json!({"subnets": ["b"]});
        assert_eq!(
            merge_mock_with_state(&mock, &real, MockMergeStrategy::Deep),
            json!({"subnets": ["a", "b"]})
        );
        assert_eq!(
            merge_mock_with_state(&mock, &real, MockMergeStrategy::DeepMapOnly),
            json!({"subnets": ["b"]})
        );
    }
}
