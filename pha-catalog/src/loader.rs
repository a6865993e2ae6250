//! Loads a policy catalog from a directory of TOML files (spec §4.1).
//!
//! Layout: one policy per `*.toml` file, file name otherwise unconstrained
//! (the `policy_id` field inside is authoritative). Unknown keys are
//! ignored by the TOML parser; the specific, required fields (`policy_id`,
//! `version`, `mechanism`, ...) are what `serde` enforces and what
//! [`crate::validator`] checks beyond structural parsing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use pha_protocol::policy::Policy;
use thiserror::Error;

use crate::validator::{ValidationError, validate_policy};
use crate::CATALOG_DIR_ENV;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("catalog directory {0} does not exist")]
    MissingDir(PathBuf),
    #[error("failed to read catalog directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read policy file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("duplicate policy id '{policy_id}' in {first} and {second}")]
    DuplicatePolicyId {
        policy_id: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Resolve the catalog directory: `PHAGENT_CATALOG_DIR` if set, else `default`.
pub fn resolve_catalog_dir(default: PathBuf) -> PathBuf {
    std::env::var_os(CATALOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or(default)
}

/// Load and validate every `*.toml` policy file directly under `dir`.
///
/// Returns policies sorted by `policy_id` for deterministic iteration order.
/// Rejects the whole load on any parse failure, schema violation, or
/// duplicate id -- catalog loading is all-or-nothing (spec §4.1: a bad
/// policy file must not silently shrink the catalog).
pub fn load_catalog_dir(dir: &Path) -> Result<Vec<Policy>, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::MissingDir(dir.to_path_buf()));
    }

    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| LoadError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut policies = Vec::with_capacity(paths.len());
    let mut seen: HashSet<String> = HashSet::new();
    let mut seen_paths: std::collections::HashMap<String, PathBuf> = std::collections::HashMap::new();

    for path in paths {
        let raw = std::fs::read_to_string(&path).map_err(|source| LoadError::ReadFile {
            path: path.clone(),
            source,
        })?;
        let policy: Policy = toml::from_str(&raw).map_err(|source| LoadError::Parse {
            path: path.clone(),
            source: Box::new(source),
        })?;

        validate_policy(&policy)?;

        if !seen.insert(policy.policy_id.clone()) {
            let first = seen_paths
                .get(&policy.policy_id)
                .cloned()
                .unwrap_or_else(|| path.clone());
            return Err(LoadError::DuplicatePolicyId {
                policy_id: policy.policy_id.clone(),
                first,
                second: path,
            });
        }
        seen_paths.insert(policy.policy_id.clone(), path.clone());

        policies.push(policy);
    }

    policies.sort_by(|a, b| a.policy_id.cmp(&b.policy_id));
    Ok(policies)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::fs;

    const SAMPLE: &str = r#"
policy_id = "tel-001"
version = "1.0.0"
name = "Disable diagnostic telemetry"
description = "Sets telemetry reporting to the minimum level"
category = "telemetry"
risk_level = "low"
support_status = "supported"

[mechanism]
mechanism = "script"
apply_command = "Set-TelemetryLevel -Level Security"
revert_command = "Set-TelemetryLevel -Level Full"
probe_command = "Get-TelemetryLevel"

[applicability]
min_build = 10240
supported_skus = ["Professional"]

[reversibility]
reversible = true
how = "re-run with the previous telemetry level"
"#;

    #[test]
    fn loads_a_single_valid_policy() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tel-001.toml"), SAMPLE).unwrap();

        let policies = load_catalog_dir(dir.path()).unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].policy_id, "tel-001");
    }

    #[test]
    fn rejects_duplicate_policy_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.toml"), SAMPLE).unwrap();
        fs::write(dir.path().join("b.toml"), SAMPLE).unwrap();

        let err = load_catalog_dir(dir.path()).unwrap_err();
        assert!(matches!(err, LoadError::DuplicatePolicyId { .. }));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let err = load_catalog_dir(Path::new("/nonexistent/catalog/dir")).unwrap_err();
        assert!(matches!(err, LoadError::MissingDir(_)));
    }

    #[test]
    fn env_override_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY-equivalent: test is single-threaded w.r.t. this env var and
        // restores it before returning.
        unsafe {
            std::env::set_var(CATALOG_DIR_ENV, dir.path());
        }
        let resolved = resolve_catalog_dir(PathBuf::from("/should/not/be/used"));
        unsafe {
            std::env::remove_var(CATALOG_DIR_ENV);
        }
        assert_eq!(resolved, dir.path());
    }
}
