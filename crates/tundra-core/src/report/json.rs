use std::path::Path;

use crate::report::RunReport;

pub fn write_json(report: &RunReport, out: &Path) -> anyhow::Result<()> {
    std::fs::write(out, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{UnitReport, UnitStatus};

    #[test]
    fn writes_readable_json() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("report.json");
        let report = RunReport {
            command: "plan".into(),
            working_dir: "/stack".into(),
            units: vec![UnitReport {
                path: "vpc".into(),
                status: UnitStatus::Succeeded,
                attempts: 1,
                duration_ms: 42,
                message: None,
                ignored_by: None,
                signals: Default::default(),
            }],
            read_files: vec![],
            duration_ms: 42,
        };
        write_json(&report, &out).unwrap();
        let parsed: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(parsed.units.len(), 1);
        assert_eq!(parsed.units[0].status, UnitStatus::Succeeded);
    }
}
