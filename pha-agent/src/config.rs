//! Layered configuration for `phagentd`.
//!
//! Three layers, later overriding earlier, the same precedence
//! `core::config_loader::ConfigLoader` uses for `~/.code/config.toml`
//! (SPEC_FULL §11):
//! 1. Hardcoded defaults.
//! 2. `config.toml` under the agent's platform config directory.
//! 3. `PHAGENT_*` environment variables.

use std::path::PathBuf;

use pha_catalog::CATALOG_DIR_ENV;
use serde::Deserialize;
use thiserror::Error;

/// Errors surfaced while assembling [`AgentConfig`].
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for ${var}: '{value}' (expected {expected})")]
    InvalidEnvValue {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// The fully merged, ready-to-use configuration a `phagentd` run operates
/// under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Directory the policy catalog loader reads `*.toml` files from.
    pub catalog_dir: PathBuf,
    /// Path to the change-log/snapshot SQLite database.
    pub store_db_path: PathBuf,
    /// Size of the IPC transport's fixed listener pool (spec §5; default 4).
    pub listener_pool_size: u32,
    /// Drift monitor tick interval, in seconds. Zero disables it (spec §4.7).
    pub drift_interval_secs: u64,
    /// Whether the drift monitor re-applies drifted policies automatically.
    pub drift_auto_remediate: bool,
    /// Whether `Apply`/`Revert` request a restore-point checkpoint by
    /// default when the caller didn't say either way. The restore-point
    /// *transport* itself is a fixed platform choice (spec §9 open
    /// question; DESIGN.md), not something this toggle changes.
    pub restore_point_enabled: bool,
}

impl AgentConfig {
    pub fn defaults() -> Self {
        Self {
            catalog_dir: default_catalog_dir(),
            store_db_path: default_store_db_path(),
            listener_pool_size: 4,
            drift_interval_secs: 0,
            drift_auto_remediate: false,
            restore_point_enabled: true,
        }
    }
}

fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_catalog_dir() -> PathBuf {
    install_dir().join("catalog")
}

fn default_store_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("phagentd")
        .join("store.db")
}

fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("phagentd").join("config.toml"))
}

/// On-disk/file-layer shape. Every field is optional so a file overriding
/// only one setting doesn't need to restate the rest; unknown keys are
/// ignored rather than rejected (matches the catalog loader's permissive
/// parsing stance, spec §4.1).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    catalog_dir: Option<PathBuf>,
    store_db_path: Option<PathBuf>,
    listener_pool_size: Option<u32>,
    drift_interval_secs: Option<u64>,
    drift_auto_remediate: Option<bool>,
    restore_point_enabled: Option<bool>,
}

/// Builds an [`AgentConfig`] from the three layers. Mirrors
/// `core::config_loader::ConfigLoader`'s builder shape.
pub struct ConfigLoader {
    config_file: Option<PathBuf>,
    env_prefix: &'static str,
    skip_file: bool,
    skip_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_file: None,
            env_prefix: "PHAGENT",
            skip_file: false,
            skip_env: false,
        }
    }

    /// Overrides the config file path (default: the platform config dir's
    /// `phagentd/config.toml`).
    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn skip_file_layer(mut self) -> Self {
        self.skip_file = true;
        self
    }

    pub fn skip_env_layer(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn load(self) -> Result<AgentConfig, ConfigLoadError> {
        let mut config = AgentConfig::defaults();

        if !self.skip_file {
            let path = self.config_file.clone().or_else(default_config_file);
            if let Some(path) = path {
                if let Some(file) = Self::load_file(&path)? {
                    Self::apply_file(&mut config, file);
                }
            }
        }

        if !self.skip_env {
            Self::apply_env(&mut config)?;
        }

        Ok(config)
    }

    fn load_file(path: &std::path::Path) -> Result<Option<FileConfig>, ConfigLoadError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(None);
            }
            Err(e) => {
                return Err(ConfigLoadError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        let parsed: FileConfig = toml::from_str(&contents).map_err(|e| ConfigLoadError::Toml {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Some(parsed))
    }

    fn apply_file(config: &mut AgentConfig, file: FileConfig) {
        if let Some(v) = file.catalog_dir {
            config.catalog_dir = v;
        }
        if let Some(v) = file.store_db_path {
            config.store_db_path = v;
        }
        if let Some(v) = file.listener_pool_size {
            config.listener_pool_size = v;
        }
        if let Some(v) = file.drift_interval_secs {
            config.drift_interval_secs = v;
        }
        if let Some(v) = file.drift_auto_remediate {
            config.drift_auto_remediate = v;
        }
        if let Some(v) = file.restore_point_enabled {
            config.restore_point_enabled = v;
        }
    }

    fn apply_env(config: &mut AgentConfig) -> Result<(), ConfigLoadError> {
        // The catalog loader already owns `PHAGENT_CATALOG_DIR` (spec §4.1);
        // the env name is shared so there is exactly one override for it.
        if let Ok(v) = std::env::var(CATALOG_DIR_ENV) {
            config.catalog_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PHAGENT_STORE_DB") {
            config.store_db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PHAGENT_LISTENER_POOL_SIZE") {
            config.listener_pool_size = v.parse().map_err(|_| ConfigLoadError::InvalidEnvValue {
                var: "PHAGENT_LISTENER_POOL_SIZE",
                value: v,
                expected: "a non-negative integer",
            })?;
        }
        if let Ok(v) = std::env::var("PHAGENT_DRIFT_INTERVAL_SECS") {
            config.drift_interval_secs =
                v.parse().map_err(|_| ConfigLoadError::InvalidEnvValue {
                    var: "PHAGENT_DRIFT_INTERVAL_SECS",
                    value: v,
                    expected: "a non-negative integer",
                })?;
        }
        if let Ok(v) = std::env::var("PHAGENT_DRIFT_AUTO_REMEDIATE") {
            config.drift_auto_remediate = parse_bool(&v).ok_or(ConfigLoadError::InvalidEnvValue {
                var: "PHAGENT_DRIFT_AUTO_REMEDIATE",
                value: v,
                expected: "true/false",
            })?;
        }
        if let Ok(v) = std::env::var("PHAGENT_RESTORE_POINT_ENABLED") {
            config.restore_point_enabled =
                parse_bool(&v).ok_or(ConfigLoadError::InvalidEnvValue {
                    var: "PHAGENT_RESTORE_POINT_ENABLED",
                    value: v,
                    expected: "true/false",
                })?;
        }
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = AgentConfig::defaults();
        assert_eq!(config.listener_pool_size, 4);
        assert_eq!(config.drift_interval_secs, 0);
        assert!(!config.drift_auto_remediate);
        assert!(config.restore_point_enabled);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new()
            .with_config_file(dir.path().join("does-not-exist.toml"))
            .skip_env_layer()
            .load()
            .unwrap();
        assert_eq!(config, AgentConfig::defaults());
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            listener_pool_size = 8
            drift_interval_secs = 3600
            drift_auto_remediate = true
            "#,
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_config_file(path)
            .skip_env_layer()
            .load()
            .unwrap();
        assert_eq!(config.listener_pool_size, 8);
        assert_eq!(config.drift_interval_secs, 3600);
        assert!(config.drift_auto_remediate);
        // Untouched fields keep their default.
        assert!(config.restore_point_enabled);
    }

    #[test]
    fn unknown_keys_in_file_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "some_future_field = 42\n").unwrap();

        let config = ConfigLoader::new()
            .with_config_file(path)
            .skip_env_layer()
            .load()
            .unwrap();
        assert_eq!(config, AgentConfig::defaults());
    }

    #[test]
    fn env_layer_overrides_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "listener_pool_size = 8\n").unwrap();

        // SAFETY-equivalent: tests run single-threaded per process for env
        // var mutation via `cargo test`'s default harness; this test does
        // not run concurrently with another that reads the same var.
        unsafe {
            std::env::set_var("PHAGENT_LISTENER_POOL_SIZE", "2");
        }
        let result = ConfigLoader::new().with_config_file(path).load();
        unsafe {
            std::env::remove_var("PHAGENT_LISTENER_POOL_SIZE");
        }

        assert_eq!(result.unwrap().listener_pool_size, 2);
    }

    #[test]
    fn invalid_env_value_is_rejected() {
        unsafe {
            std::env::set_var("PHAGENT_LISTENER_POOL_SIZE", "not-a-number");
        }
        let result = ConfigLoader::new().skip_file_layer().load();
        unsafe {
            std::env::remove_var("PHAGENT_LISTENER_POOL_SIZE");
        }
        assert!(matches!(
            result,
            Err(ConfigLoadError::InvalidEnvValue { var: "PHAGENT_LISTENER_POOL_SIZE", .. })
        ));
    }
}
