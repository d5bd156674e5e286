//! Engine entry point (spec §4.9): resolves targets through the target
//! server, plans jobs against the checktype catalog, runs them through an
//! agent driver, and returns the collected report.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::warn;

use crate::agent::{self, AgentDriver, DockerAgentDriver};
use crate::catalog::new_checktype_catalog;
use crate::error::EngineError;
use crate::planner::new_job_list;
use crate::report::ReportStore;
use crate::targetserver::TargetServer;
use crate::types::{AgentConfig, EngineReport, Target};

/// Run a full scan: resolve targets, plan checks, execute them through a
/// [`DockerAgentDriver`], and return the per-check report index (spec
/// §4.9).
pub async fn run(
    checktype_urls: &[String],
    targets: &[Target],
    agent_config: AgentConfig,
) -> Result<EngineReport, EngineError> {
    let docker = agent::connect_local()?;
    let bridge_host = agent::bridge_gateway(&docker).await?;
    let driver = Arc::new(DockerAgentDriver::new(docker, agent_config));
    run_with_driver(checktype_urls, targets, driver, bridge_host).await
}

/// Same as [`run`], but against a caller-supplied agent driver and bridge
/// host (used by tests to avoid depending on a live Docker daemon).
pub async fn run_with_driver(
    checktype_urls: &[String],
    targets: &[Target],
    driver: Arc<dyn AgentDriver>,
    bridge_host: IpAddr,
) -> Result<EngineReport, EngineError> {
    let target_server = TargetServer::new(bridge_host).await?;

    let result = run_inner(checktype_urls, targets, driver, &target_server).await;
    target_server.close().await;
    result
}

async fn run_inner(
    checktype_urls: &[String],
    targets: &[Target],
    driver: Arc<dyn AgentDriver>,
    target_server: &TargetServer,
) -> Result<EngineReport, EngineError> {
    let mut resolved = Vec::with_capacity(targets.len());
    for target in targets {
        let key = target.cache_key();
        match target_server.handle(&key, target).await {
            Ok(map) if !map.is_zero() => resolved.push(Target {
                identifier: map.new_identifier,
                asset_type: map.new_asset_type,
                options: target.options.clone(),
            }),
            Ok(_) => resolved.push(target.clone()),
            Err(err) if err.is_no_rewrite() => resolved.push(target.clone()),
            Err(err) => return Err(err.into()),
        }
    }

    let catalog = new_checktype_catalog(checktype_urls).await?;
    let jobs = new_job_list(&catalog, &resolved)?;
    if jobs.is_empty() {
        warn!("no jobs planned, returning empty report");
        return Ok(EngineReport::new());
    }

    let report_store = Arc::new(ReportStore::new());
    driver.run(jobs, report_store.clone()).await?;
    Ok(report_store.snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::types::{AssetType, Checktype, ChecktypeCatalog};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopDriver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentDriver for NoopDriver {
        async fn run(
            &self,
            jobs: Vec<crate::types::Job>,
            _report_store: Arc<ReportStore>,
        ) -> Result<(), AgentError> {
            self.calls.fetch_add(jobs.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn loopback() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn empty_catalog_short_circuits_without_invoking_agent() {
        let driver = Arc::new(NoopDriver {
            calls: AtomicUsize::new(0),
        });
        let targets = vec![Target::new("example.com", AssetType::DomainName)];
        let report = run_with_driver(&[], &targets, driver.clone(), loopback())
            .await
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(driver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_targets_yields_empty_report_without_error() {
        let driver = Arc::new(NoopDriver {
            calls: AtomicUsize::new(0),
        });
        let report = run_with_driver(&[], &[], driver.clone(), loopback())
            .await
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(driver.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn catalog_smoke_test_constructs_checks() {
        let mut catalog = ChecktypeCatalog::default();
        catalog.checktypes.insert(
            "ct".to_string(),
            Checktype {
                name: "ct".to_string(),
                description: String::new(),
                image: "ct:latest".to_string(),
                timeout: 180,
                assets: vec![AssetType::DomainName],
                required_vars: Vec::new(),
                options: HashMap::new(),
            },
        );
        let targets = vec![Target::new("example.com", AssetType::DomainName)];
        let jobs = new_job_list(&catalog, &targets).unwrap();
        assert_eq!(jobs.len(), 1);
    }
}
