//! Error taxonomy (spec §7). Each component owns a `thiserror` enum; the
//! engine's top-level error wraps them with `#[from]`, mirroring the
//! teacher's `SyncError` pattern in `rustup.rs`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GitUrlError {
    #[error("invalid git url: {0}")]
    InvalidUrl(String),
    #[error("invalid asset type for address derivation")]
    InvalidAssetType,
    #[error("empty host in url")]
    EmptyHost,
    #[error("invalid port in url")]
    InvalidPort,
}

#[derive(Error, Debug)]
pub enum GitServerError {
    #[error("git executable not found or not invocable: {0}")]
    GitNotFound(std::io::Error),
    #[error("failed to create scratch directory: {0}")]
    ScratchDir(std::io::Error),
    #[error("failed to clone repository {path}: {source}")]
    Clone {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to add path {path}: {source}")]
    AddPath {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git2 error: {0}")]
    Git2(#[from] git2::Error),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("proxy stream spec is malformed: {0}")]
    MalformedStream(String),
    #[error("proxy group already closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum TargetServerError {
    #[error(transparent)]
    GitServer(#[from] GitServerError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    GitUrl(#[from] GitUrlError),
    #[error("not a loopback address")]
    NotLoopback,
    #[error("stat failed on {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid asset type")]
    InvalidAssetType,
}

impl TargetServerError {
    /// Errors the engine treats as "no rewrite needed" rather than fatal
    /// (spec §4.4/§7): the target simply isn't a loopback service, or its
    /// asset type has no derivable address.
    pub fn is_no_rewrite(&self) -> bool {
        matches!(
            self,
            TargetServerError::NotLoopback
                | TargetServerError::GitUrl(GitUrlError::InvalidAssetType)
        )
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid scheme: {0}")]
    InvalidScheme(String),
    #[error("http error fetching {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("non-2xx status {status} fetching {url}")]
    BadStatus { url: String, status: u16 },
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json catalog document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("required_vars entry is not a string: {0}")]
    NonStringRequiredVar(serde_json::Value),
    #[error("failed to serialize check options: {0}")]
    Options(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("agent exited with non-zero status: {0}")]
    NonZeroExit(i64),
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("failed to join container task: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("could not determine docker bridge network gateway")]
    NoBridgeGateway,
}

#[derive(Error, Debug)]
pub enum ReportStoreError {
    #[error("unknown upload kind: {0}")]
    UnknownKind(String),
    #[error("invalid report payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse yaml config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    TargetServer(#[from] TargetServerError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    ReportStore(#[from] ReportStoreError),
}
