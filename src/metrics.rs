//! Process-wide metrics collector (spec §9 design note, §4.13 supplement).
//!
//! Modeled as an owned value threaded through the engine rather than a
//! global singleton, so tests can construct a fresh one per case.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::error::ConfigError;

/// Flat counter accumulator for a single run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Metrics {
    checks_planned: u64,
    checks_finished: u64,
    checks_failed: u64,
    checks_aborted: u64,
    checks_inconclusive: u64,
    vulnerabilities_found: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_planned(&mut self, n: u64) {
        self.checks_planned += n;
    }

    pub fn record_finished(&mut self) {
        self.checks_finished += 1;
    }

    pub fn record_failed(&mut self) {
        self.checks_failed += 1;
    }

    pub fn record_aborted(&mut self) {
        self.checks_aborted += 1;
    }

    pub fn record_inconclusive(&mut self) {
        self.checks_inconclusive += 1;
    }

    pub fn record_vulnerabilities(&mut self, n: u64) {
        self.vulnerabilities_found += n;
    }

    fn as_map(&self) -> HashMap<&'static str, u64> {
        HashMap::from([
            ("checks_planned", self.checks_planned),
            ("checks_finished", self.checks_finished),
            ("checks_failed", self.checks_failed),
            ("checks_aborted", self.checks_aborted),
            ("checks_inconclusive", self.checks_inconclusive),
            ("vulnerabilities_found", self.vulnerabilities_found),
        ])
    }

    /// Emit the counters as a flat JSON object at `path`.
    pub async fn write_file(&self, path: &Path) -> Result<(), ConfigError> {
        let body = serde_json::to_vec_pretty(&self.as_map()).unwrap_or_default();
        tokio::fs::write(path, body)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })
    }

    /// Tally an [`EngineReport`](crate::types::EngineReport) into the
    /// counters in one pass, used after the engine collects reports.
    pub fn record_report(&mut self, report: &crate::types::EngineReport) {
        for entry in report.values() {
            match entry.status {
                crate::types::CheckStatus::Finished => self.record_finished(),
                crate::types::CheckStatus::Failed => self.record_failed(),
                crate::types::CheckStatus::Aborted => self.record_aborted(),
                crate::types::CheckStatus::Inconclusive => self.record_inconclusive(),
                crate::types::CheckStatus::Running => {}
            }
            self.record_vulnerabilities(entry.vulnerabilities.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckStatus, Report, Vulnerability};
    use uuid::Uuid;

    #[test]
    fn record_report_tallies_status_and_vulnerability_counts() {
        let mut metrics = Metrics::new();
        let mut report = crate::types::EngineReport::new();
        report.insert(
            Uuid::new_v4(),
            Report {
                check_id: Uuid::new_v4(),
                checktype_name: "ct".to_string(),
                status: CheckStatus::Finished,
                target: "t".to_string(),
                options: String::new(),
                start_time: crate::types::chrono_like::Timestamp(0),
                end_time: crate::types::chrono_like::Timestamp(0),
                vulnerabilities: vec![Vulnerability::default(), Vulnerability::default()],
            },
        );
        metrics.record_report(&report);
        assert_eq!(metrics.checks_finished, 1);
        assert_eq!(metrics.vulnerabilities_found, 2);
    }

    #[tokio::test]
    async fn write_file_emits_flat_json() {
        let mut metrics = Metrics::new();
        metrics.record_planned(3);
        let file = tempfile::NamedTempFile::new().unwrap();
        metrics.write_file(file.path()).await.unwrap();
        let body = tokio::fs::read_to_string(file.path()).await.unwrap();
        let parsed: HashMap<String, u64> = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["checks_planned"], 3);
    }
}
