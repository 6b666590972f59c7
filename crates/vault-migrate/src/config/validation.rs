//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};
use url::Url;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    match Url::parse(&config.source.root_uri) {
        Ok(url) if url.scheme() == "vos" => {}
        _ => {
            return Err(MigrateError::Config(format!(
                "source.root_uri must be a vos:// URI, got '{}'",
                config.source.root_uri
            )))
        }
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.schema.is_empty()
        || !config
            .target
            .schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(MigrateError::Config(format!(
            "target.schema '{}' is not a plain identifier",
            config.target.schema
        )));
    }

    crate::target::SslMode::parse(&config.target.ssl_mode)?;

    // Migration config validation - workers only checked if explicitly set
    if let Some(0) = config.migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if config.migration.page_size < 2 {
        return Err(MigrateError::Config(
            "migration.page_size must be at least 2".into(),
        ));
    }
    if config.migration.queue_capacity == 0 {
        return Err(MigrateError::Config(
            "migration.queue_capacity must be at least 1".into(),
        ));
    }
    if config.migration.poll_interval_secs == 0 {
        return Err(MigrateError::Config(
            "migration.poll_interval_secs must be at least 1".into(),
        ));
    }

    // Replay
    if config.replay.batch_size < 2 {
        return Err(MigrateError::Config(
            "replay.batch_size must be at least 2".into(),
        ));
    }
    if config.replay.checkpoint_buffer == 0 {
        return Err(MigrateError::Config(
            "replay.checkpoint_buffer must be at least 1".into(),
        ));
    }
    if config.replay.job_name.is_empty() {
        return Err(MigrateError::Config("replay.job_name is required".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, ReplayConfig, SourceConfig, TargetConfig};
    use uuid::Uuid;

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                host: "localhost".to_string(),
                port: 1433,
                database: "vospace".to_string(),
                user: "sa".to_string(),
                password: "password".to_string(),
                encrypt: "false".to_string(),
                trust_server_cert: true,
                root_uri: "vos://cadc.nrc.ca!vault".to_string(),
            },
            target: TargetConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "vospace".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                schema: "vospace".to_string(),
                ssl_mode: "disable".to_string(),
                root_id: Uuid::nil(),
            },
            migration: MigrationConfig::default(),
            replay: ReplayConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_root_uri_must_be_vos() {
        let mut config = valid_config();
        config.source.root_uri = "https://cadc.nrc.ca/vault".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_schema_must_be_identifier() {
        let mut config = valid_config();
        config.target.schema = "vospace; drop table node".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_ssl_mode_rejected() {
        let mut config = valid_config();
        config.target.ssl_mode = "prefer".to_string();
        assert!(validate(&config).is_err());
        config.target.ssl_mode = "verify-full".to_string();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = valid_config();
        config.migration.workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_page_size_of_one_rejected() {
        let mut config = valid_config();
        config.migration.page_size = 1;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_checkpoint_buffer_rejected() {
        let mut config = valid_config();
        config.replay.checkpoint_buffer = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_source_config_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }

    #[test]
    fn test_target_config_debug_redacts_password() {
        let mut config = valid_config();
        config.target.password = "super_secret_password_456".to_string();
        let debug_output = format!("{:?}", config.target);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_456"));
    }
}
