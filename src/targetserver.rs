//! Target server (spec §4.4): composes the git server and proxy group so
//! containerized checks can reach local targets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;
use url::Url;

use crate::error::TargetServerError;
use crate::giturl::{get_target_addr, parse_git_url, resolve_loopback_ip};
use crate::gitserver::GitServer;
use crate::proxy::{ProxyEvent, ProxyGroup};
use crate::types::{AssetType, Target, TargetMap};

/// The host on which containers reach the host machine's loopback
/// services and the embedded git server, once rewritten.
pub const DOCKER_INTERNAL_HOST: &str = "host.docker.internal";

pub struct TargetServer {
    git_server: Arc<GitServer>,
    bridge_git_addr: SocketAddr,
    bridge_host: std::net::IpAddr,
    proxy: Mutex<ProxyGroup>,
    _proxy_events: Mutex<tokio::sync::mpsc::UnboundedReceiver<ProxyEvent>>,
    cache: Mutex<HashMap<String, TargetMap>>,
}

impl TargetServer {
    /// Start the embedded git server bound to the docker bridge host, on
    /// an ephemeral port.
    pub async fn new(bridge_host: std::net::IpAddr) -> Result<Self, TargetServerError> {
        let git_server = GitServer::new().await?;
        let bridge_git_addr = git_server
            .listen_and_serve(SocketAddr::new(bridge_host, 0))
            .await?;
        let (proxy, proxy_events) = ProxyGroup::new();
        Ok(Self {
            git_server,
            bridge_git_addr,
            bridge_host,
            proxy: Mutex::new(proxy),
            _proxy_events: Mutex::new(proxy_events),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn bridge_git_base_url(&self) -> String {
        format!("http://{}", self.bridge_git_addr)
    }

    /// Resolve `target` into a (possibly zero-valued) [`TargetMap`],
    /// caching the result by `key`.
    pub async fn handle(
        &self,
        key: &str,
        target: &Target,
    ) -> Result<TargetMap, TargetServerError> {
        {
            let cache = self.cache.lock().await;
            if let Some(map) = cache.get(key) {
                return Ok(map.clone());
            }
        }

        let map = self.handle_uncached(target).await?;

        let mut cache = self.cache.lock().await;
        cache.insert(key.to_string(), map.clone());
        Ok(map)
    }

    async fn handle_uncached(&self, target: &Target) -> Result<TargetMap, TargetServerError> {
        match target.asset_type {
            AssetType::GitRepository => self.handle_git_repository(target).await,
            AssetType::Path => self.handle_path(target).await,
            _ => self.handle_loopback_candidate(target).await,
        }
    }

    async fn handle_git_repository(&self, target: &Target) -> Result<TargetMap, TargetServerError> {
        let path = std::path::Path::new(&target.identifier);
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => return Ok(TargetMap::default()), // treat as remote repo
        };
        if !metadata.is_dir() {
            return Err(TargetServerError::Stat {
                path: target.identifier.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            });
        }

        let name = self.git_server.add_repository(path).await?;
        Ok(TargetMap {
            old_identifier: target.identifier.clone(),
            old_asset_type: target.asset_type,
            new_identifier: format!("{}/{}", self.bridge_git_base_url(), name),
            new_asset_type: AssetType::GitRepository,
        })
    }

    async fn handle_path(&self, target: &Target) -> Result<TargetMap, TargetServerError> {
        let path = std::path::Path::new(&target.identifier);
        let name = self.git_server.add_path(path).await?;
        Ok(TargetMap {
            old_identifier: target.identifier.clone(),
            old_asset_type: target.asset_type,
            new_identifier: format!("{}/{}", self.bridge_git_base_url(), name),
            new_asset_type: AssetType::GitRepository,
        })
    }

    async fn handle_loopback_candidate(
        &self,
        target: &Target,
    ) -> Result<TargetMap, TargetServerError> {
        let host_port = get_target_addr(target)?;
        let (host, port) = match host_port.split_once(':') {
            Some((h, p)) => (h.to_string(), Some(p.to_string())),
            None => (host_port.clone(), None),
        };

        let loopback_ip = resolve_loopback_ip(&host).ok_or(TargetServerError::NotLoopback)?;

        let dial_port: u16 = port
            .as_deref()
            .map(|p| p.parse::<u16>())
            .transpose()
            .map_err(|_| TargetServerError::InvalidAssetType)?
            .unwrap_or(0);
        let dial_addr = SocketAddr::new(loopback_ip, dial_port);

        {
            let mut proxy = self.proxy.lock().await;
            let listen_addr = SocketAddr::new(self.bridge_host, dial_port);
            proxy.add_stream(listen_addr, dial_addr).await?;
        }

        let new_identifier = rewrite_host(&target.identifier, &host, DOCKER_INTERNAL_HOST);
        Ok(TargetMap {
            old_identifier: target.identifier.clone(),
            old_asset_type: target.asset_type,
            new_identifier,
            new_asset_type: target.asset_type,
        })
    }

    /// The cached map for `key`, if one has been computed.
    pub async fn target_map(&self, key: &str) -> Option<TargetMap> {
        self.cache.lock().await.get(key).cloned()
    }

    /// Close the git server and proxy group, releasing all resources.
    pub async fn close(&self) {
        self.git_server.close().await;
        self.proxy.lock().await.close().await;
    }
}

/// Replace `old_host` with `new_host` in `identifier`, preserving port and
/// URL shape. Handles bare `host`/`host:port` identifiers (IP/Hostname
/// asset types) as well as full URLs (WebAddress) and git URLs
/// (GitRepository, including scp-like forms, which are normalized to
/// `ssh://` in the process per spec §8).
fn rewrite_host(identifier: &str, old_host: &str, new_host: &str) -> String {
    if let Ok(mut url) = Url::parse(identifier) {
        if url.set_host(Some(new_host)).is_ok() {
            return url.to_string();
        }
    }
    if let Ok(url) = parse_git_url(identifier) {
        let mut url = url;
        if url.set_host(Some(new_host)).is_ok() {
            return url.to_string();
        }
    }
    // Bare `host` or `host:port`.
    if let Some(rest) = identifier.strip_prefix(old_host) {
        return format!("{new_host}{rest}");
    }
    identifier.replacen(old_host, new_host, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_bare_host() {
        assert_eq!(rewrite_host("127.0.0.1", "127.0.0.1", DOCKER_INTERNAL_HOST), DOCKER_INTERNAL_HOST);
    }

    #[test]
    fn rewrites_web_address_preserving_port_and_path() {
        let rewritten = rewrite_host(
            "http://127.0.0.1:12345/p",
            "127.0.0.1",
            DOCKER_INTERNAL_HOST,
        );
        assert_eq!(rewritten, "http://host.docker.internal:12345/p");
    }

    #[test]
    fn rewrites_scp_like_git_identifier_via_ssh_normalization() {
        let rewritten = rewrite_host(
            "git@example.com:/p.git",
            "example.com",
            "example.com",
        );
        assert_eq!(rewritten, "ssh://git@example.com/p.git");
    }

    #[tokio::test]
    async fn loopback_ip_target_is_not_rewritten_for_private_ip() {
        // 192.168.1.1 is not loopback; handling it should error, which the
        // engine treats as "no rewrite needed".
        let server = TargetServer::new("127.0.0.1".parse().unwrap()).await.unwrap();
        let target = Target::new("192.168.1.1", AssetType::IP);
        let result = server.handle("k", &target).await;
        assert!(matches!(result, Err(TargetServerError::NotLoopback)));
        server.close().await;
    }

    #[tokio::test]
    async fn docker_image_is_not_loopback_and_errors() {
        let server = TargetServer::new("127.0.0.1".parse().unwrap()).await.unwrap();
        let target = Target::new("alpine:3.18", AssetType::DockerImage);
        let result = server.handle("k", &target).await;
        assert!(result.is_err());
        server.close().await;
    }

    #[tokio::test]
    async fn git_repository_missing_path_is_zero_map() {
        let server = TargetServer::new("127.0.0.1".parse().unwrap()).await.unwrap();
        let target = Target::new("/nonexistent/path/xyz", AssetType::GitRepository);
        let map = server.handle("k", &target).await.unwrap();
        assert!(map.is_zero());
        server.close().await;
    }

    #[tokio::test]
    async fn git_repository_on_a_file_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let server = TargetServer::new("127.0.0.1".parse().unwrap()).await.unwrap();
        let target = Target::new(file.path().to_str().unwrap(), AssetType::GitRepository);
        let result = server.handle("k", &target).await;
        assert!(matches!(result, Err(TargetServerError::Stat { .. })));
        server.close().await;
    }

    #[tokio::test]
    async fn loopback_host_given_by_name_is_proxied_not_rejected() {
        let server = TargetServer::new("127.0.0.1".parse().unwrap()).await.unwrap();
        let target = Target::new("http://localhost:12399/p", AssetType::WebAddress);
        let map = server.handle("k", &target).await.unwrap();
        assert!(!map.is_zero());
        assert_eq!(map.new_identifier, "http://host.docker.internal:12399/p");
        server.close().await;
    }
}
