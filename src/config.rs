//! Config loader (spec §4.11, ambient supplement). Reads a YAML file into
//! a [`RunConfig`], substituting `${VAR}` references against the process
//! environment before parsing.

use std::path::Path;

use crate::error::ConfigError;
use crate::types::RunConfig;

/// Load and parse a run config from `path`.
pub async fn load_config(path: &Path) -> Result<RunConfig, ConfigError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    let substituted = substitute_env_vars(&raw);
    let config: RunConfig = serde_yaml::from_str(&substituted)?;
    Ok(config)
}

/// Replace `${VAR}` references with the matching environment variable's
/// value. A missing variable is left as the literal `${VAR}` text.
fn substitute_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Starter config written by the `init` CLI subcommand: placeholder
/// checktype URLs, one example target, empty agent vars.
pub fn starter_config_yaml() -> String {
    r#"lava_version: "1"
checktype_urls:
  - "https://example.com/checktypes.json"
targets:
  - identifier: "example.com"
    assetType: "DomainName"
agent_config:
  parallel: 4
  pull_policy: if-not-present
  vars: {}
  registries: []
report_config:
  format: human
  severity_threshold: INFO
log_level: info
"#
    .to_string()
}

/// Write the starter config to `path`, failing if it already exists unless
/// `force` is set.
pub async fn write_starter_config(path: &Path, force: bool) -> Result<(), ConfigError> {
    if !force && tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(ConfigError::Read {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "config already exists"),
        });
    }
    tokio::fs::write(path, starter_config_yaml())
        .await
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_env_var() {
        std::env::set_var("SCANHIVE_TEST_VAR", "hello");
        let out = substitute_env_vars("value: ${SCANHIVE_TEST_VAR}");
        assert_eq!(out, "value: hello");
        std::env::remove_var("SCANHIVE_TEST_VAR");
    }

    #[test]
    fn leaves_missing_var_literal() {
        std::env::remove_var("SCANHIVE_DEFINITELY_MISSING");
        let out = substitute_env_vars("value: ${SCANHIVE_DEFINITELY_MISSING}");
        assert_eq!(out, "value: ${SCANHIVE_DEFINITELY_MISSING}");
    }

    #[tokio::test]
    async fn load_config_parses_yaml() {
        let file = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), starter_config_yaml())
            .await
            .unwrap();
        let config = load_config(file.path()).await.unwrap();
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.agent_config.parallel, 4);
    }

    #[tokio::test]
    async fn write_starter_config_refuses_to_overwrite() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = write_starter_config(file.path(), false).await;
        assert!(result.is_err());
    }
}
