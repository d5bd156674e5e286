//! Report store (spec §4.8): implements the agent's upload-callback
//! contract and indexes per-check reports by check ID.

use std::collections::HashMap;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ReportStoreError;
use crate::types::{CheckStatus, EngineReport, Report};

/// Absorbs `(checkID, kind, payload)` upload callbacks from the agent
/// driver and indexes the resulting reports.
#[derive(Default)]
pub struct ReportStore {
    reports: Mutex<HashMap<Uuid, Report>>,
}

impl ReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `kind == "reports"`: parse and store, replacing any previous entry
    /// for `check_id`. `kind == "logs"`: accepted silently. Anything else
    /// is an unknown-kind error. Returns an empty upload-link string, since
    /// this store has no external backing (spec §4.8).
    pub async fn upload_check_data(
        &self,
        check_id: Uuid,
        kind: &str,
        payload: &[u8],
    ) -> Result<String, ReportStoreError> {
        match kind {
            "reports" => {
                let report: Report = serde_json::from_slice(payload)?;
                self.reports.lock().await.insert(check_id, report);
                Ok(String::new())
            }
            "logs" => Ok(String::new()),
            other => Err(ReportStoreError::UnknownKind(other.to_string())),
        }
    }

    /// Per-status counts, for the agent driver's progress ticker.
    pub async fn summary(&self) -> HashMap<CheckStatus, usize> {
        let reports = self.reports.lock().await;
        let mut counts = HashMap::new();
        for report in reports.values() {
            *counts.entry(report.status).or_insert(0) += 1;
        }
        counts
    }

    /// Snapshot the stored reports as the engine's final result.
    pub async fn snapshot(&self) -> EngineReport {
        self.reports.lock().await.clone()
    }
}
