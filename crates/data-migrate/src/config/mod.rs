//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration (secrets excluded).
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Signing key for file state: a hash of the data sources and state
    /// settings only, so tuning and timeouts can change between runs.
    pub fn state_key(&self) -> String {
        let sources = serde_yaml::to_string(&self.data_sources).unwrap_or_default();
        let state = serde_yaml::to_string(&self.state).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(sources.as_bytes());
        hasher.update(state.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl DataSourceConfig {
    /// Build a connection string for tokio-postgres.
    pub fn pg_connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={}",
            self.host,
            self.get_port(),
            self.database,
            self.user,
            self.password,
            if self.ssl_mode == "disable" { "disable" } else { "require" }
        )
    }
}
