//! Core data model shared by the engine's components (spec §3).

use std::collections::HashMap;
use std::fmt;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What kind of thing a target identifier denotes.
#[derive(
    Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialOrd, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "PascalCase")]
pub enum AssetType {
    /// Unset: the planner must infer candidates from the identifier shape.
    #[default]
    #[serde(rename = "")]
    Empty,
    IP,
    Hostname,
    WebAddress,
    GitRepository,
    DockerImage,
    AWSAccount,
    IPRange,
    DomainName,
    /// Local extension: a file or directory served as a synthetic git repo.
    Path,
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetType::Empty => "",
            AssetType::IP => "IP",
            AssetType::Hostname => "Hostname",
            AssetType::WebAddress => "WebAddress",
            AssetType::GitRepository => "GitRepository",
            AssetType::DockerImage => "DockerImage",
            AssetType::AWSAccount => "AWSAccount",
            AssetType::IPRange => "IPRange",
            AssetType::DomainName => "DomainName",
            AssetType::Path => "Path",
        };
        f.write_str(s)
    }
}

/// A scan target: something a checktype runs against.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Target {
    pub identifier: String,
    #[serde(default, rename = "assetType")]
    pub asset_type: AssetType,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

impl Target {
    pub fn new(identifier: impl Into<String>, asset_type: AssetType) -> Self {
        Self {
            identifier: identifier.into(),
            asset_type,
            options: HashMap::new(),
        }
    }

    /// Stable key used to cache target-server rewrites (spec §4.4).
    pub fn cache_key(&self) -> String {
        format!("{}#{}", self.identifier, self.asset_type)
    }
}

/// A containerized check descriptor (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checktype {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub image: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub assets: Vec<AssetType>,
    #[serde(default, rename = "required_vars")]
    pub required_vars: Vec<Value>,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

fn default_timeout() -> u64 {
    180
}

impl Checktype {
    pub fn accepts(&self, asset_type: AssetType) -> bool {
        self.assets.contains(&asset_type)
    }
}

/// Wire format for a fetched catalog document (spec §6).
#[derive(Debug, Deserialize)]
pub struct ChecktypeDocument {
    pub checktypes: Vec<Checktype>,
}

/// A checktype name -> descriptor mapping, merged from one or more catalogs.
#[derive(Clone, Debug, Default)]
pub struct ChecktypeCatalog {
    pub checktypes: HashMap<String, Checktype>,
}

impl ChecktypeCatalog {
    pub fn merge(&mut self, doc: ChecktypeDocument) {
        for checktype in doc.checktypes {
            self.checktypes.insert(checktype.name.clone(), checktype);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checktype> {
        self.checktypes.values()
    }

    pub fn is_empty(&self) -> bool {
        self.checktypes.is_empty()
    }
}

/// A planned (checktype, target, options) instance, before it becomes a job.
#[derive(Clone, Debug)]
pub struct Check {
    pub id: Uuid,
    pub checktype: Checktype,
    pub target: Target,
    pub options: HashMap<String, Value>,
}

impl Check {
    /// Key used to collapse duplicate checks (spec §4.6 step 3).
    pub fn dedup_key(&self) -> String {
        let mut opts: Vec<_> = self.options.iter().collect();
        opts.sort_by(|a, b| a.0.cmp(b.0));
        format!(
            "{}::{}::{}::{:?}",
            self.checktype.name, self.target.identifier, self.target.asset_type, opts
        )
    }
}

/// A job record handed to the agent driver's queue (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub check_id: Uuid,
    pub image: String,
    pub target: String,
    pub asset_type: String,
    /// JSON-serialized check options.
    pub options: String,
    pub required_vars: Vec<String>,
    pub start_time: chrono_like::Timestamp,
}

/// A minimal RFC3339 timestamp wrapper, avoiding a hard dependency on a
/// datetime crate the teacher repo did not already carry.
pub mod chrono_like {
    use serde::{Deserialize, Serialize};
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp(pub u64);

    impl Timestamp {
        pub fn now() -> Self {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            Self(secs)
        }
    }
}

/// Records a rewrite applied by the target server (spec §3).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetMap {
    pub old_identifier: String,
    pub old_asset_type: AssetType,
    pub new_identifier: String,
    pub new_asset_type: AssetType,
}

impl TargetMap {
    /// A zero-valued map means "no rewrite needed".
    pub fn is_zero(&self) -> bool {
        self.new_identifier.is_empty()
    }
}

/// Vulnerability severity (spec §3 supplement), ordered low to high.
#[derive(
    Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialOrd, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_score(score: f32) -> Self {
        if score <= 0.0 {
            Severity::Info
        } else if score < 4.0 {
            Severity::Low
        } else if score < 7.0 {
            Severity::Medium
        } else if score < 9.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }

    /// Exit-code contribution, per spec §6 (100 none .. 104 critical).
    pub fn exit_code(self) -> i32 {
        match self {
            Severity::Info => 100,
            Severity::Low => 101,
            Severity::Medium => 102,
            Severity::High => 103,
            Severity::Critical => 104,
        }
    }
}

/// A single finding inside a check's report (spec §3 supplement).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Vulnerability {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "affected_resource")]
    pub affected_resource: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub resources: Vec<serde_json::Value>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl Vulnerability {
    pub fn effective_severity(&self) -> Severity {
        self.severity.unwrap_or_else(|| Severity::from_score(self.score))
    }
}

/// Lifecycle status of a planned check (spec §3).
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Running,
    Finished,
    Aborted,
    Failed,
    Inconclusive,
}

/// The per-check report the agent uploads via its callback contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
    pub check_id: Uuid,
    pub checktype_name: String,
    pub status: CheckStatus,
    pub target: String,
    #[serde(default)]
    pub options: String,
    pub start_time: chrono_like::Timestamp,
    pub end_time: chrono_like::Timestamp,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
}

/// The engine's final result: a per-check report index.
pub type EngineReport = HashMap<Uuid, Report>;

/// Image pull behavior for the agent driver (spec §4.7 supplement).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

/// Credentials for a private registry the agent driver may need to pull
/// checktype images from.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub server: String,
    pub username: String,
    pub password: String,
}

/// The agent driver's run configuration (spec §4.7, §3 supplement).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub parallel: usize,
    #[serde(default)]
    pub pull_policy: PullPolicy,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub registries: Vec<RegistryAuth>,
}

/// Output shape selector for the report renderer (spec §4.12 supplement).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Human,
    Json,
}

/// How the report renderer should present an [`EngineReport`] (spec §4.12
/// supplement).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub format: ReportFormat,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub severity_threshold: Severity,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            format: ReportFormat::default(),
            output: None,
            severity_threshold: Severity::Info,
        }
    }
}

/// The fully resolved run configuration consumed by the CLI layer (spec §6,
/// §3 supplement).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_lava_version")]
    pub lava_version: String,
    #[serde(default)]
    pub checktype_urls: Vec<String>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub agent_config: AgentConfig,
    #[serde(default)]
    pub report_config: ReportConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where to emit the run's metrics counters, if anywhere (spec §4.13).
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
}

fn default_lava_version() -> String {
    "1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The process's exit code, derived from an [`EngineReport`] (spec §3, §6
/// supplement): the highest vulnerability severity seen across all checks,
/// OR'd with 3 if any check failed or was aborted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub fn from_report(report: &EngineReport) -> Self {
        let mut max_severity: Option<Severity> = None;
        let mut any_failed = false;
        for entry in report.values() {
            for vuln in &entry.vulnerabilities {
                let severity = vuln.effective_severity();
                max_severity = Some(match max_severity {
                    Some(current) if current >= severity => current,
                    _ => severity,
                });
            }
            if matches!(entry.status, CheckStatus::Failed | CheckStatus::Aborted) {
                any_failed = true;
            }
        }
        let base = max_severity.map(Severity::exit_code).unwrap_or(0);
        Self(if any_failed { base | 3 } else { base })
    }
}
