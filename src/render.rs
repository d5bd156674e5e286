//! Report renderer (spec §4.12, ambient supplement). Renders an
//! [`EngineReport`] as either a human-readable summary or pretty JSON,
//! alongside the computed [`ExitCode`].

use crate::types::{EngineReport, ExitCode, ReportConfig, ReportFormat};

/// Render `report` per `config.format`, returning the rendered text and
/// the exit code the CLI layer should use.
pub fn render(report: &EngineReport, config: &ReportConfig) -> (String, ExitCode) {
    let exit_code = ExitCode::from_report(report);
    let text = match config.format {
        ReportFormat::Human => render_human(report, config),
        ReportFormat::Json => render_json(report),
    };
    (text, exit_code)
}

fn render_human(report: &EngineReport, config: &ReportConfig) -> String {
    let mut out = String::new();
    out.push_str("target\tchecktype\tstatus\tvulnerabilities\thighest severity\n");

    let mut entries: Vec<_> = report.values().collect();
    entries.sort_by(|a, b| a.target.cmp(&b.target).then(a.checktype_name.cmp(&b.checktype_name)));

    for entry in &entries {
        let highest = entry
            .vulnerabilities
            .iter()
            .map(|v| v.effective_severity())
            .max();
        out.push_str(&format!(
            "{}\t{}\t{:?}\t{}\t{}\n",
            entry.target,
            entry.checktype_name,
            entry.status,
            entry.vulnerabilities.len(),
            highest.map(|s| format!("{s:?}")).unwrap_or_else(|| "-".to_string()),
        ));
    }

    out.push('\n');
    for entry in &entries {
        for vuln in &entry.vulnerabilities {
            if vuln.effective_severity() < config.severity_threshold {
                continue;
            }
            out.push_str(&format!(
                "[{:?}] {} ({})\n  {}\n  affected: {}\n",
                vuln.effective_severity(),
                vuln.summary,
                entry.target,
                vuln.description,
                vuln.affected_resource,
            ));
        }
    }
    out
}

fn render_json(report: &EngineReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{chrono_like::Timestamp, CheckStatus, Report, Severity, Vulnerability};
    use uuid::Uuid;

    fn sample_report() -> EngineReport {
        let mut report = EngineReport::new();
        report.insert(
            Uuid::new_v4(),
            Report {
                check_id: Uuid::new_v4(),
                checktype_name: "ct".to_string(),
                status: CheckStatus::Finished,
                target: "example.com".to_string(),
                options: String::new(),
                start_time: Timestamp(0),
                end_time: Timestamp(0),
                vulnerabilities: vec![Vulnerability {
                    summary: "finding".to_string(),
                    severity: Some(Severity::High),
                    ..Default::default()
                }],
            },
        );
        report
    }

    #[test]
    fn human_format_includes_summary_and_detail() {
        let report = sample_report();
        let config = ReportConfig::default();
        let (text, exit_code) = render(&report, &config);
        assert!(text.contains("example.com"));
        assert!(text.contains("finding"));
        assert_eq!(exit_code.0, Severity::High.exit_code());
    }

    #[test]
    fn detail_respects_severity_threshold() {
        let report = sample_report();
        let mut config = ReportConfig::default();
        config.severity_threshold = Severity::Critical;
        let (text, _) = render(&report, &config);
        assert!(!text.contains("finding"));
    }

    #[test]
    fn json_format_round_trips_as_valid_json() {
        let report = sample_report();
        let config = ReportConfig {
            format: ReportFormat::Json,
            ..ReportConfig::default()
        };
        let (text, _) = render(&report, &config);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(parsed.is_object());
    }
}
