//! Human-readable end-of-run summary, written to stderr so it never mixes
//! with engine stdout (`output`, `show -json`, ...).

use crate::report::{RunReport, UnitStatus};

fn status_label(status: UnitStatus) -> &'static str {
    match status {
        UnitStatus::Succeeded => "ok",
        UnitStatus::Failed => "failed",
        UnitStatus::Excluded => "excluded",
        UnitStatus::EarlyExit => "skipped",
        UnitStatus::Cancelled => "cancelled",
    }
}

pub fn format_summary(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} across {} unit(s) in {:.1}s\n",
        report.command,
        report.units.len(),
        report.duration_ms as f64 / 1000.0
    ));
    for unit in &report.units {
        let mut line = format!("  {:<9} {}", status_label(unit.status), unit.path);
        if unit.attempts > 1 {
            line.push_str(&format!(" ({} attempts)", unit.attempts));
        }
        if let Some(rule) = &unit.ignored_by {
            line.push_str(&format!(" [ignored by {rule}]"));
        }
        if let Some(message) = &unit.message {
            line.push_str(&format!(": {message}"));
        }
        out.push_str(&line);
        out.push('\n');
    }
    let failed = report.count(UnitStatus::Failed);
    if failed > 0 {
        out.push_str(&format!("{failed} unit(s) failed\n"));
    }
    out
}

pub fn print_summary(report: &RunReport) {
    eprint!("{}", format_summary(report));
}
