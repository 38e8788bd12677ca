use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::leadership::DEFAULT_MAX_CLAIM_ATTEMPTS;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub claim: ClaimConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,
}

/// Document store backend. Production deployments point this crate at an
/// external transactional store; the in-memory backend serves single-node
/// runs and tests.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClaimConfig {
    /// Conditional-write attempts before a claim reports excessive
    /// contention.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_CLAIM_ATTEMPTS
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                Ok(toml::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.log.format, LogFormat::Text);
        assert_eq!(cfg.store.backend, Backend::Memory);
        assert_eq!(cfg.claim.max_attempts, DEFAULT_MAX_CLAIM_ATTEMPTS);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regent.toml");
        std::fs::write(&path, "[log]\nformat = \"json\"\n").unwrap();
        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.claim.max_attempts, DEFAULT_MAX_CLAIM_ATTEMPTS);
    }

    #[test]
    fn load_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn parses_toml() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [log]
            format = "json"

            [claim]
            max_attempts = 9
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.claim.max_attempts, 9);
        assert_eq!(cfg.store.backend, Backend::Memory);
    }
}
