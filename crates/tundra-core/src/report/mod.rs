//! Structured run reports.
//!
//! Whatever the outcome, a run produces one row per unit: terminal status,
//! attempts, duration, the ignore rule that fired (if any) and its signals.

pub mod console;
pub mod json;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded,
    Failed,
    Excluded,
    /// Not run: a dependency failed, or fail-fast skipped it.
    EarlyExit,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    pub path: String,
    pub status: UnitStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Label of the ignore rule that downgraded a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored_by: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub signals: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub command: String,
    pub working_dir: String,
    pub units: Vec<UnitReport>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub read_files: Vec<String>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    /// Exit-code success: every non-excluded unit succeeded or was ignored.
    /// Cancellation by an external signal is not a failure.
    pub fn success(&self) -> bool {
        self.count(UnitStatus::Failed) == 0
    }

    pub fn ignored(&self) -> usize {
        self.units.iter().filter(|u| u.ignored_by.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: UnitStatus) -> UnitReport {
        UnitReport {
            path: "unit".into(),
            status,
            attempts: 1,
            duration_ms: 5,
            message: None,
            ignored_by: None,
            signals: BTreeMap::new(),
        }
    }

    #[test]
    fn success_tolerates_everything_but_failures() {
        let report = RunReport {
            command: "apply".into(),
            working_dir: "/stack".into(),
            units: vec![
                row(UnitStatus::Succeeded),
                row(UnitStatus::Excluded),
                row(UnitStatus::Cancelled),
                row(UnitStatus::EarlyExit),
            ],
            read_files: vec![],
            duration_ms: 10,
        };
        assert!(report.success());
    }

    #[test]
    fn any_failed_unit_fails_the_run() {
        let report = RunReport {
            command: "apply".into(),
            working_dir: "/stack".into(),
            units: vec![row(UnitStatus::Succeeded), row(UnitStatus::Failed)],
            read_files: vec![],
            duration_ms: 10,
        };
        assert!(!report.success());
        assert_eq!(report.count(UnitStatus::Failed), 1);
    }

    #[test]
    fn serializes_without_empty_optionals() {
        let value = serde_json::to_value(row(UnitStatus::Succeeded)).unwrap();
        assert_eq!(value["status"], "succeeded");
        assert!(value.get("message").is_none());
        assert!(value.get("signals").is_none());
    }
}
