//! YAML configuration file.

use std::path::Path;

use serde::Deserialize;

use faythe_cluster::DEFAULT_LEASE_TTL;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Keyspace backend settings. An empty endpoint list selects the
/// in-process backend (standalone mode, no clustering).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct EtcdConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Membership settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: DEFAULT_LEASE_TTL,
        }
    }
}

fn default_lease_ttl() -> i64 {
    DEFAULT_LEASE_TTL
}

impl Config {
    /// Read and parse the file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("cannot parse {}: {e}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"
etcd:
  endpoints:
    - "http://etcd-1:2379"
    - "http://etcd-2:2379"
  username: faythe
  password: secret
cluster:
  lease_ttl_secs: 30
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.etcd.endpoints.len(), 2);
        assert_eq!(config.etcd.username.as_deref(), Some("faythe"));
        assert_eq!(config.cluster.lease_ttl_secs, 30);
    }

    #[test]
    fn empty_config_is_standalone() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.etcd.endpoints.is_empty());
        assert_eq!(config.cluster.lease_ttl_secs, DEFAULT_LEASE_TTL);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(serde_yaml::from_str::<Config>("surprise: true").is_err());
    }
}
