//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::kv::Key;
use crate::slicer::SlicerPolicy;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxiparamConfig {
    /// Per-node settings.
    pub node: Option<NodeConfig>,
    /// Cluster shape.
    pub cluster: Option<ClusterConfig>,
}

/// Per-node settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    /// Sharding policy: `"range"` or `"modulo"`.
    pub slicer: Option<String>,
    /// Diagnostic verbosity, 0..=2. No functional effect.
    pub verbose: Option<u8>,
}

/// Cluster shape, identical on every node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    /// Number of server nodes.
    pub num_servers: Option<usize>,
    /// Number of worker nodes.
    pub num_workers: Option<usize>,
    /// Exclusive upper bound of the key space.
    pub max_key: Option<Key>,
}

impl OxiparamConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIPARAM_CONFIG` env var (if set),
    /// then apply `OXIPARAM__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXIPARAM_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIPARAM__") {
                continue;
            }
            let path = key["OXIPARAM__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["node", "slicer"] => {
                    self.node_mut().slicer = Some(value);
                }
                ["node", "verbose"] => {
                    self.node_mut().verbose = Some(parse_value(&key, &value)?);
                }
                ["cluster", "num_servers"] => {
                    self.cluster_mut().num_servers = Some(parse_value(&key, &value)?);
                }
                ["cluster", "num_workers"] => {
                    self.cluster_mut().num_workers = Some(parse_value(&key, &value)?);
                }
                ["cluster", "max_key"] => {
                    self.cluster_mut().max_key = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// The configured sharding policy (default: range).
    pub fn slicer_policy(&self) -> Result<SlicerPolicy, ConfigError> {
        match self.node.as_ref().and_then(|n| n.slicer.as_deref()) {
            None => Ok(SlicerPolicy::default()),
            Some(s) => SlicerPolicy::from_str(s).map_err(|_| ConfigError::InvalidValue {
                key: "node.slicer".to_string(),
                value: s.to_string(),
            }),
        }
    }

    /// The configured verbosity (default: 0).
    pub fn verbose(&self) -> u8 {
        self.node.as_ref().and_then(|n| n.verbose).unwrap_or(0)
    }

    /// The configured server count (default: 1).
    pub fn num_servers(&self) -> usize {
        self.cluster
            .as_ref()
            .and_then(|c| c.num_servers)
            .unwrap_or(1)
    }

    /// The configured worker count (default: 1).
    pub fn num_workers(&self) -> usize {
        self.cluster
            .as_ref()
            .and_then(|c| c.num_workers)
            .unwrap_or(1)
    }

    /// The configured key space bound (default: `u64::MAX`).
    pub fn max_key(&self) -> Key {
        self.cluster
            .as_ref()
            .and_then(|c| c.max_key)
            .unwrap_or(Key::MAX)
    }

    fn node_mut(&mut self) -> &mut NodeConfig {
        self.node.get_or_insert_with(NodeConfig::default)
    }

    fn cluster_mut(&mut self) -> &mut ClusterConfig {
        self.cluster.get_or_insert_with(ClusterConfig::default)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OxiparamConfig::default();
        assert_eq!(config.slicer_policy().unwrap(), SlicerPolicy::Range);
        assert_eq!(config.verbose(), 0);
        assert_eq!(config.num_servers(), 1);
        assert_eq!(config.num_workers(), 1);
        assert_eq!(config.max_key(), u64::MAX);
    }

    #[test]
    fn test_parse_toml() {
        let config: OxiparamConfig = toml::from_str(
            r#"
            [node]
            slicer = "modulo"
            verbose = 2

            [cluster]
            num_servers = 3
            num_workers = 2
            max_key = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.slicer_policy().unwrap(), SlicerPolicy::Modulo);
        assert_eq!(config.verbose(), 2);
        assert_eq!(config.num_servers(), 3);
        assert_eq!(config.num_workers(), 2);
        assert_eq!(config.max_key(), 30);
    }

    #[test]
    fn test_invalid_slicer_value() {
        let config: OxiparamConfig = toml::from_str(
            r#"
            [node]
            slicer = "hash"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.slicer_policy(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
