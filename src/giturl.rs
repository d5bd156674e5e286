//! Git URL / address utilities (spec §4.1).
//!
//! `parseGitURL` accepts both conventional URLs and scp-like
//! `user@host:path` shorthand; `getTargetAddr` derives `host[:port]` for a
//! target by asset type; `isLoopback` resolves a host and checks for a
//! loopback IP.

use std::net::ToSocketAddrs;

use url::Url;

use crate::error::GitUrlError;
use crate::types::{AssetType, Target};

/// Recognize scp-like syntax (`user@host:path`) per the rule in spec §4.1:
/// the first `:` must precede any `/`.
fn is_scp_like(s: &str) -> bool {
    let colon = s.find(':');
    let slash = s.find('/');
    match (colon, slash) {
        (Some(c), Some(sl)) => c < sl,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Parse a conventional or scp-like git URL into a [`Url`].
pub fn parse_git_url(s: &str) -> Result<Url, GitUrlError> {
    if is_scp_like(s) && !s.contains("://") {
        let (userhost, path) = s
            .split_once(':')
            .ok_or_else(|| GitUrlError::InvalidUrl(s.to_string()))?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let rewritten = format!("ssh://{userhost}{path}");
        return Url::parse(&rewritten).map_err(|_| GitUrlError::InvalidUrl(s.to_string()));
    }
    Url::parse(s).map_err(|_| GitUrlError::InvalidUrl(s.to_string()))
}

/// Returns `host[:port]` for a TCP service name/scheme known to have a
/// conventional default port.
fn known_scheme_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "git" => Some(9418),
        "ssh" => Some(22),
        "ftp" => Some(21),
        _ => None,
    }
}

/// `host[:port]`, filling in a scheme-default port when the URL has none
/// explicit (spec §4.1 `guessHostPort`).
pub fn guess_host_port(u: &Url) -> Result<String, GitUrlError> {
    let host = u.host_str().ok_or(GitUrlError::EmptyHost)?;
    if let Some(port) = u.port() {
        return Ok(format!("{host}:{port}"));
    }
    if let Some(port) = known_scheme_port(u.scheme()) {
        return Ok(format!("{host}:{port}"));
    }
    Ok(host.to_string())
}

/// `getTargetAddr`: derive `host[:port]` for a target, dispatching on asset
/// type (spec §4.1).
pub fn get_target_addr(target: &Target) -> Result<String, GitUrlError> {
    match target.asset_type {
        AssetType::IP | AssetType::Hostname => Ok(target.identifier.clone()),
        AssetType::WebAddress => {
            let u = Url::parse(&target.identifier).map_err(|_| GitUrlError::InvalidPort)?;
            guess_host_port(&u)
        }
        AssetType::GitRepository => {
            let u = parse_git_url(&target.identifier)?;
            guess_host_port(&u)
        }
        _ => Err(GitUrlError::InvalidAssetType),
    }
}

/// Resolve `host` via DNS and return the first loopback IP it resolves to,
/// if any. DNS failure yields `None`, same as a non-loopback host.
pub fn resolve_loopback_ip(host: &str) -> Option<std::net::IpAddr> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return ip.is_loopback().then_some(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .map(|a| a.ip())
        .find(|ip| ip.is_loopback())
}

/// Resolve `host` via DNS and report whether any resolved IP is loopback.
/// DNS failure is treated as "not loopback" per spec §4.1.
pub fn is_loopback(host: &str) -> bool {
    resolve_loopback_ip(host).is_some()
}
