//! Agent driver (spec §4.7). The external container-execution agent is
//! modeled as the [`AgentDriver`] trait; [`DockerAgentDriver`] is the one
//! concretization shipped, driving the local Docker daemon directly
//! (pull → create → start → wait → remove per job) instead of shelling out
//! to a separate agent process.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::network::InspectNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::report::ReportStore;
use crate::types::{AgentConfig, Job, PullPolicy, RegistryAuth};

const DOCKER_SOCK_PATH: &str = "/var/run/docker.sock";
const BRIDGE_NETWORK_NAME: &str = "bridge";

/// Connect to the local Docker daemon using the environment's default
/// connection settings (`DOCKER_HOST`, TLS vars, or the platform default
/// socket/pipe).
pub fn connect_local() -> Result<Docker, AgentError> {
    Ok(Docker::connect_with_local_defaults()?)
}

/// The gateway IP of the daemon's default bridge network: the address a
/// container on that network reaches the host through (spec §4.4's "Docker
/// bridge host"). Looked up from the daemon rather than assumed, since it
/// varies per host/daemon configuration (e.g. `172.17.0.1`).
pub async fn bridge_gateway(docker: &Docker) -> Result<IpAddr, AgentError> {
    let network = docker
        .inspect_network(
            BRIDGE_NETWORK_NAME,
            Some(InspectNetworkOptions::<&str> {
                verbose: false,
                ..Default::default()
            }),
        )
        .await?;
    gateway_from_ipam(network.ipam)
}

fn gateway_from_ipam(ipam: Option<bollard::models::Ipam>) -> Result<IpAddr, AgentError> {
    let gateway = ipam
        .and_then(|ipam| ipam.config)
        .into_iter()
        .flatten()
        .find_map(|config| config.gateway)
        .ok_or(AgentError::NoBridgeGateway)?;
    gateway.parse().map_err(|_| AgentError::NoBridgeGateway)
}

/// Submits jobs to a container-execution backend and drives them to
/// completion, uploading each check's report via the report store.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn run(&self, jobs: Vec<Job>, report_store: Arc<ReportStore>) -> Result<(), AgentError>;
}

/// Drives jobs against the local Docker daemon's Engine API.
pub struct DockerAgentDriver {
    docker: Docker,
    config: AgentConfig,
}

impl DockerAgentDriver {
    /// Build a driver around an already-connected Docker client, so the
    /// caller can share one client (and its discovered bridge gateway)
    /// between the agent driver and the target server.
    pub fn new(docker: Docker, config: AgentConfig) -> Self {
        Self { docker, config }
    }

    fn credentials_for(&self, image: &str) -> Option<DockerCredentials> {
        let server = image.split('/').next().unwrap_or(image);
        self.config
            .registries
            .iter()
            .find(|reg| reg.server == server)
            .map(registry_credentials)
    }

    fn container_hook(&self) -> ContainerHook {
        ContainerHook::new(&self.config.vars)
    }
}

fn registry_credentials(auth: &RegistryAuth) -> DockerCredentials {
    DockerCredentials {
        username: Some(auth.username.clone()),
        password: Some(auth.password.clone()),
        serveraddress: Some(auth.server.clone()),
        ..Default::default()
    }
}

/// Per-check container configuration applied before every container is
/// created (spec §4.7): host-gateway routing, reachability env vars, and
/// (when the local daemon is reachable over a unix socket) a `DOCKER_HOST`
/// passthrough so checks can themselves talk to Docker.
struct ContainerHook {
    extra_hosts: Vec<String>,
    env: Vec<String>,
    binds: Vec<String>,
}

impl ContainerHook {
    fn new(vars: &HashMap<String, String>) -> Self {
        let mut env: Vec<String> = vars.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.push("VULCAN_ALLOW_PRIVATE_IPS=true".to_string());
        env.push("VULCAN_SKIP_REACHABILITY=true".to_string());

        let mut binds = Vec::new();
        if Path::new(DOCKER_SOCK_PATH).exists() {
            env.push(format!("DOCKER_HOST=unix://{DOCKER_SOCK_PATH}"));
            binds.push(format!("{DOCKER_SOCK_PATH}:{DOCKER_SOCK_PATH}"));
        }

        Self {
            extra_hosts: vec!["host.docker.internal:host-gateway".to_string()],
            env,
            binds,
        }
    }

    fn host_config(&self) -> HostConfig {
        HostConfig {
            extra_hosts: Some(self.extra_hosts.clone()),
            binds: if self.binds.is_empty() {
                None
            } else {
                Some(self.binds.clone())
            },
            ..Default::default()
        }
    }
}

#[async_trait]
impl AgentDriver for DockerAgentDriver {
    /// Runs every job, bounded by a semaphore sized to
    /// `max(1, cfg.parallel)`, while a background task logs a progress
    /// summary from the report store every 15 seconds. A non-zero
    /// container exit is recorded as a failed check report rather than
    /// aborting the run; only a driver-level failure (e.g. the Docker
    /// daemon being unreachable, or a task panicking) surfaces as an
    /// [`AgentError`].
    async fn run(&self, jobs: Vec<Job>, report_store: Arc<ReportStore>) -> Result<(), AgentError> {
        let concurrency = self.config.parallel.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let ticker_stop = Arc::new(Notify::new());
        let ticker = spawn_summary_ticker(report_store.clone(), ticker_stop.clone());

        let mut set = tokio::task::JoinSet::new();
        for job in jobs {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let docker = self.docker.clone();
            let hook = self.container_hook();
            let credentials = self.credentials_for(&job.image);
            let store = report_store.clone();
            set.spawn(async move {
                let _permit = permit;
                run_job(docker, job, hook, credentials, store).await
            });
        }

        while let Some(result) = set.join_next().await {
            result?;
        }

        ticker_stop.notify_one();
        let _ = ticker.await;
        Ok(())
    }
}

fn spawn_summary_ticker(
    report_store: Arc<ReportStore>,
    stop: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = report_store.summary().await;
                    info!(?summary, "check run progress");
                }
                _ = stop.notified() => break,
            }
        }
    })
}

/// Pull the image, create and start the container, wait for it to exit,
/// capture its stdout as the check's report payload, and remove it.
async fn run_job(
    docker: Docker,
    job: Job,
    hook: ContainerHook,
    credentials: Option<DockerCredentials>,
    report_store: Arc<ReportStore>,
) {
    let check_id = job.check_id;
    if let Err(err) = pull_image(&docker, &job.image, credentials).await {
        warn!(%check_id, %err, "failed to pull checktype image");
        upload_failure(&report_store, &job, &err.to_string()).await;
        return;
    }

    let container_name = format!("scanhive-{check_id}");
    let config = container_config(&job, &hook);
    let create = docker
        .create_container(
            Some(CreateContainerOptions {
                name: container_name.clone(),
                platform: None,
            }),
            config,
        )
        .await;
    let container_id = match create {
        Ok(response) => response.id,
        Err(err) => {
            warn!(%check_id, %err, "failed to create container");
            upload_failure(&report_store, &job, &err.to_string()).await;
            return;
        }
    };

    if let Err(err) = docker
        .start_container(&container_id, None::<StartContainerOptions<String>>)
        .await
    {
        warn!(%check_id, %err, "failed to start container");
        upload_failure(&report_store, &job, &err.to_string()).await;
        let _ = remove_container(&docker, &container_id).await;
        return;
    }

    let mut wait_stream = docker.wait_container(&container_id, None::<WaitContainerOptions<String>>);
    let wait_result = wait_stream.next().await;
    let exit_ok = matches!(&wait_result, Some(Ok(response)) if response.status_code == 0);

    let stdout = collect_stdout(&docker, &container_id).await;
    let _ = remove_container(&docker, &container_id).await;

    if !exit_ok {
        debug!(%check_id, "checktype container exited non-zero");
        upload_failure(&report_store, &job, "checktype container exited non-zero").await;
        return;
    }

    match report_store
        .upload_check_data(check_id, "reports", stdout.as_bytes())
        .await
    {
        Ok(_) => {}
        Err(err) => {
            warn!(%check_id, %err, "checktype produced an invalid report");
        }
    }
}

async fn pull_image(
    docker: &Docker,
    image: &str,
    credentials: Option<DockerCredentials>,
) -> Result<(), bollard::errors::Error> {
    let mut stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        }),
        None,
        credentials,
    );
    while let Some(event) = stream.next().await {
        event?;
    }
    Ok(())
}

fn container_config(job: &Job, hook: &ContainerHook) -> Config<String> {
    let mut env = hook.env.clone();
    env.push(format!("CHECK_TARGET={}", job.target));
    env.push(format!("CHECK_ASSET_TYPE={}", job.asset_type));
    env.push(format!("CHECK_OPTIONS={}", job.options));
    Config {
        image: Some(job.image.clone()),
        env: Some(env),
        host_config: Some(hook.host_config()),
        ..Default::default()
    }
}

async fn collect_stdout(docker: &Docker, container_id: &str) -> String {
    let mut stream = docker.logs(
        container_id,
        Some(LogsOptions::<String> {
            stdout: true,
            stderr: false,
            ..Default::default()
        }),
    );
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        if let Ok(log) = chunk {
            out.push_str(&log.to_string());
        }
    }
    out
}

async fn remove_container(docker: &Docker, container_id: &str) -> Result<(), bollard::errors::Error> {
    docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
}

async fn upload_failure(report_store: &ReportStore, job: &Job, reason: &str) {
    let payload = serde_json::json!({
        "check_id": job.check_id,
        "checktype_name": job.image,
        "status": "FAILED",
        "target": job.target,
        "options": job.options,
        "start_time": job.start_time.0,
        "end_time": job.start_time.0,
        "vulnerabilities": [],
    });
    debug!(check_id = %job.check_id, %reason, "recording failed check report");
    let _ = report_store
        .upload_check_data(
            job.check_id,
            "reports",
            serde_json::to_vec(&payload).unwrap_or_default().as_slice(),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{Ipam, IpamConfig};
    use std::collections::HashMap;

    #[test]
    fn gateway_from_ipam_reads_first_config_gateway() {
        let ipam = Ipam {
            config: Some(vec![IpamConfig {
                gateway: Some("172.17.0.1".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let gateway = gateway_from_ipam(Some(ipam)).unwrap();
        assert_eq!(gateway, "172.17.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn gateway_from_ipam_errors_when_missing() {
        let err = gateway_from_ipam(None);
        assert!(matches!(err, Err(AgentError::NoBridgeGateway)));

        let ipam = Ipam {
            config: Some(vec![IpamConfig::default()]),
            ..Default::default()
        };
        assert!(matches!(
            gateway_from_ipam(Some(ipam)),
            Err(AgentError::NoBridgeGateway)
        ));
    }

    #[test]
    fn container_hook_sets_reachability_vars_and_host_gateway() {
        let vars = HashMap::new();
        let hook = ContainerHook::new(&vars);
        assert!(hook.env.iter().any(|e| e == "VULCAN_ALLOW_PRIVATE_IPS=true"));
        assert!(hook.env.iter().any(|e| e == "VULCAN_SKIP_REACHABILITY=true"));
        assert_eq!(hook.extra_hosts, vec!["host.docker.internal:host-gateway".to_string()]);
    }

    #[test]
    fn container_hook_carries_user_vars() {
        let mut vars = HashMap::new();
        vars.insert("FOO".to_string(), "bar".to_string());
        let hook = ContainerHook::new(&vars);
        assert!(hook.env.iter().any(|e| e == "FOO=bar"));
    }

    #[test]
    fn container_config_forwards_job_options_verbatim() {
        let hook = ContainerHook::new(&HashMap::new());
        let job = Job {
            check_id: uuid::Uuid::new_v4(),
            image: "ct:latest".to_string(),
            target: "example.com".to_string(),
            asset_type: "DomainName".to_string(),
            options: r#"{"depth":2}"#.to_string(),
            required_vars: Vec::new(),
            start_time: crate::types::chrono_like::Timestamp::now(),
        };
        let config = container_config(&job, &hook);
        let env = config.env.unwrap();
        assert!(env.contains(&r#"CHECK_OPTIONS={"depth":2}"#.to_string()));
    }
}
