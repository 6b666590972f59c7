//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
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
}

impl SourceConfig {
    /// Normalized `encrypt` setting; anything unrecognized means encrypted.
    pub fn encrypt_enabled(&self) -> bool {
        !matches!(
            self.encrypt.to_lowercase().as_str(),
            "false" | "no" | "0" | "disable"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  host: mssql.internal
  database: vospace
  user: reader
  password: s3cret
  encrypt: "no"
target:
  host: pg.internal
  database: vospace
  user: writer
  password: hunter2
  root_id: 00000000-0000-0000-0000-000000000001
migration:
  workers: 3
  page_size: 250
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 1433);
        assert_eq!(config.source.root_uri, "vos://cadc.nrc.ca!vault");
        assert_eq!(config.target.port, 5432);
        assert_eq!(config.target.schema, "vospace");
        assert_eq!(config.migration.get_workers(), 3);
        assert_eq!(config.migration.page_size, 250);
        assert_eq!(config.migration.queue_capacity, 2000);
        assert_eq!(config.migration.poll_interval_secs, 6);
        assert!(!config.migration.property_cache);
        assert_eq!(config.replay.batch_size, 1000);
        assert_eq!(config.replay.checkpoint_buffer, 1);
        assert_eq!(config.replay.job_name, "migrate-deletions");
        assert_eq!(config.replay.source_id, "db:mssql:vospace");
    }

    #[test]
    fn test_encrypt_setting() {
        let mut config = Config::from_yaml(YAML).unwrap();
        assert!(!config.source.encrypt_enabled());
        assert_eq!(config.target.ssl_mode, "require");
        config.source.encrypt = "strict".to_string();
        assert!(config.source.encrypt_enabled());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, YAML).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.source.host, "mssql.internal");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = Config::from_yaml("source: [").unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
