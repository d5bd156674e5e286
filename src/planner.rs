//! Job planner (spec §4.6): expands `checktype x target` into concrete
//! [`Check`]s, then lowers those into [`Job`] queue records.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use crate::error::PlannerError;
use crate::types::{
    chrono_like::Timestamp, AssetType, Check, ChecktypeCatalog, Job, Target,
};

/// Infer the asset types an identifier's shape could represent. Treated as
/// an oracle per spec §9 — this reproduces the outcomes spec §8 requires,
/// not a full lexer.
pub fn detect_asset_types(identifier: &str) -> Vec<AssetType> {
    if identifier.is_empty() {
        return Vec::new();
    }

    if let Ok(url) = url::Url::parse(identifier) {
        match url.scheme() {
            "http" | "https" => return vec![AssetType::Hostname, AssetType::WebAddress],
            "git" | "ssh" | "git+ssh" => return vec![AssetType::GitRepository],
            _ => {}
        }
    }

    if identifier.contains('@') && identifier.contains(':') && !identifier.contains("://") {
        return vec![AssetType::GitRepository];
    }

    if let Ok(ip) = identifier.parse::<std::net::IpAddr>() {
        let _ = ip;
        return vec![AssetType::IP];
    }

    if identifier.contains('/') && identifier.rsplit('/').next().unwrap_or("").parse::<u8>().is_ok()
    {
        // Looks like a CIDR range, e.g. 10.0.0.0/8.
        if identifier.split('/').next().unwrap_or("").parse::<std::net::IpAddr>().is_ok() {
            return vec![AssetType::IPRange];
        }
    }

    if looks_like_docker_image(identifier) {
        return vec![AssetType::DockerImage];
    }

    if identifier.contains('.') && !identifier.contains('/') {
        let labels: Vec<&str> = identifier.split('.').collect();
        if identifier.starts_with("www.") || labels.len() > 2 {
            return vec![AssetType::Hostname];
        }
        return vec![AssetType::Hostname, AssetType::DomainName];
    }

    Vec::new()
}

fn looks_like_docker_image(identifier: &str) -> bool {
    if identifier.contains("://") || identifier.contains('@') {
        return false;
    }
    // `name:tag` or `registry/name:tag`, no dots-only hostnames.
    if let Some((_, tag)) = identifier.rsplit_once(':') {
        return !tag.is_empty() && !tag.contains('/');
    }
    false
}

/// Candidate asset types for `target`: itself, if set; otherwise every
/// inferred type (spec §4.6 step 1).
fn candidate_asset_types(target: &Target) -> Vec<AssetType> {
    if target.asset_type != AssetType::Empty {
        vec![target.asset_type]
    } else {
        detect_asset_types(&target.identifier)
    }
}

/// Merge checktype options with target options, target winning per
/// top-level key (spec §4.6 step 2, §9 shallow-merge decision).
fn merge_options(
    checktype_options: &HashMap<String, Value>,
    target_options: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    let mut merged = checktype_options.clone();
    for (k, v) in target_options {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Stage 1: expand targets against the catalog into deduplicated checks.
pub fn generate_checks(catalog: &ChecktypeCatalog, targets: &[Target]) -> Vec<Check> {
    let mut checks = Vec::new();
    let mut seen = HashSet::new();

    for target in targets {
        let candidates = candidate_asset_types(target);
        for checktype in catalog.iter() {
            for &asset_type in &candidates {
                if !checktype.accepts(asset_type) {
                    continue;
                }
                let resolved_target = Target {
                    identifier: target.identifier.clone(),
                    asset_type,
                    options: target.options.clone(),
                };
                let check = Check {
                    id: Uuid::new_v4(),
                    checktype: checktype.clone(),
                    options: merge_options(&checktype.options, &target.options),
                    target: resolved_target,
                };
                let key = check.dedup_key();
                if seen.insert(key) {
                    checks.push(check);
                }
            }
        }
    }
    checks
}

/// Stage 2: lower checks into job queue records.
pub fn generate_jobs(checks: Vec<Check>) -> Result<Vec<Job>, PlannerError> {
    checks
        .into_iter()
        .map(|check| {
            let options = serde_json::to_string(&check.options)?;
            let required_vars = check
                .checktype
                .required_vars
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| PlannerError::NonStringRequiredVar(v.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Job {
                check_id: check.id,
                image: check.checktype.image.clone(),
                target: check.target.identifier.clone(),
                asset_type: check.target.asset_type.to_string(),
                options,
                required_vars,
                start_time: Timestamp::now(),
            })
        })
        .collect()
}

/// The full two-stage pipeline (spec §4.6).
pub fn new_job_list(catalog: &ChecktypeCatalog, targets: &[Target]) -> Result<Vec<Job>, PlannerError> {
    let checks = generate_checks(catalog, targets);
    generate_jobs(checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Checktype;

    fn checktype(name: &str, assets: &[AssetType]) -> Checktype {
        Checktype {
            name: name.to_string(),
            description: String::new(),
            image: format!("{name}:latest"),
            timeout: 180,
            assets: assets.to_vec(),
            required_vars: Vec::new(),
            options: HashMap::new(),
        }
    }

    #[test]
    fn planner_determinism_single_check() {
        let mut catalog = ChecktypeCatalog::default();
        catalog
            .checktypes
            .insert("ct".into(), checktype("ct", &[AssetType::DomainName]));
        let targets = vec![Target::new("example.com", AssetType::DomainName)];
        let checks = generate_checks(&catalog, &targets);
        assert_eq!(checks.len(), 1);
    }

    #[test]
    fn option_merge_target_wins() {
        let mut checktype_options = HashMap::new();
        checktype_options.insert("a".to_string(), Value::from(1));
        checktype_options.insert("b".to_string(), Value::from(2));
        checktype_options.insert("c".to_string(), Value::from(3));
        let mut target_options = HashMap::new();
        target_options.insert("b".to_string(), Value::from("x"));

        let merged = merge_options(&checktype_options, &target_options);
        assert_eq!(merged["a"], Value::from(1));
        assert_eq!(merged["b"], Value::from("x"));
        assert_eq!(merged["c"], Value::from(3));
    }

    #[test]
    fn duplicate_targets_collapse_to_one_check() {
        let mut catalog = ChecktypeCatalog::default();
        catalog
            .checktypes
            .insert("ct".into(), checktype("ct", &[AssetType::Hostname]));
        let targets = vec![
            Target::new("www.example.com", AssetType::Hostname),
            Target::new("www.example.com", AssetType::Hostname),
        ];
        let checks = generate_checks(&catalog, &targets);
        assert_eq!(checks.len(), 1);
    }

    #[test]
    fn inference_single_hostname_candidate() {
        let mut catalog = ChecktypeCatalog::default();
        catalog
            .checktypes
            .insert("ct".into(), checktype("ct", &[AssetType::Hostname]));
        let targets = vec![Target::new("www.example.com", AssetType::Empty)];
        let checks = generate_checks(&catalog, &targets);
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].target.asset_type, AssetType::Hostname);
    }

    #[test]
    fn inference_two_candidates_yield_two_checks() {
        let mut catalog = ChecktypeCatalog::default();
        catalog.checktypes.insert(
            "ct".into(),
            checktype("ct", &[AssetType::Hostname, AssetType::DomainName]),
        );
        let targets = vec![Target::new("example.com", AssetType::Empty)];
        let checks = generate_checks(&catalog, &targets);
        assert_eq!(checks.len(), 2);
    }

    #[test]
    fn unknown_asset_type_yields_no_checks() {
        let mut catalog = ChecktypeCatalog::default();
        catalog
            .checktypes
            .insert("ct".into(), checktype("ct", &[AssetType::DomainName]));
        let targets = vec![Target::new("example.com", AssetType::IP)];
        let checks = generate_checks(&catalog, &targets);
        assert!(checks.is_empty());
    }

    #[test]
    fn empty_catalog_or_targets_yields_empty_jobs() {
        let catalog = ChecktypeCatalog::default();
        let targets = vec![Target::new("example.com", AssetType::DomainName)];
        assert!(new_job_list(&catalog, &targets).unwrap().is_empty());

        let mut catalog = ChecktypeCatalog::default();
        catalog
            .checktypes
            .insert("ct".into(), checktype("ct", &[AssetType::DomainName]));
        assert!(new_job_list(&catalog, &[]).unwrap().is_empty());
    }

    #[test]
    fn required_vars_must_be_strings() {
        let mut ct = checktype("ct", &[AssetType::DomainName]);
        ct.required_vars = vec![Value::from(42)];
        let check = Check {
            id: Uuid::new_v4(),
            checktype: ct,
            target: Target::new("example.com", AssetType::DomainName),
            options: HashMap::new(),
        };
        let result = generate_jobs(vec![check]);
        assert!(matches!(result, Err(PlannerError::NonStringRequiredVar(_))));
    }
}
