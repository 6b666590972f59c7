//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use sysinfo::System;
use tracing::info;
use uuid::Uuid;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Legacy node store (MSSQL).
    pub source: SourceConfig,

    /// New node store (PostgreSQL).
    pub target: TargetConfig,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub replay: ReplayConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source node store (MSSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub host: String,

    #[serde(default = "default_mssql_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    pub password: String,

    /// Encrypt connection (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    #[serde(default)]
    pub trust_server_cert: bool,

    /// Namespace root the legacy paths are rendered under.
    #[serde(default = "default_root_uri")]
    pub root_uri: String,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("root_uri", &self.root_uri)
            .finish()
    }
}

/// Destination node store (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    pub password: String,

    /// Schema holding the node and harvest-state tables (default: "vospace").
    #[serde(default = "default_vospace_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Id of the destination root container; parent of every top-level node.
    pub root_id: Uuid,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("root_id", &self.root_id)
            .finish()
    }
}

/// Migration behavior configuration.
/// Fields that are auto-tuned use Option<T> to distinguish between
/// "not set" and "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Number of concurrent subtree jobs. Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Children fetched per listing query.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Capacity of each job's producer/consumer queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Seconds between scheduler status reports.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Prefetch every node property once per run instead of per node.
    #[serde(default)]
    pub property_cache: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_source_connections: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_target_connections: Option<usize>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: None,
            page_size: default_page_size(),
            queue_capacity: default_queue_capacity(),
            poll_interval_secs: default_poll_interval(),
            property_cache: false,
            max_source_connections: None,
            max_target_connections: None,
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Jobs are I/O bound: cores - 2, at least 2, at most 32
        let workers = *self
            .workers
            .get_or_insert_with(|| resources.cpu_cores.saturating_sub(2).clamp(2, 32));

        // Each job holds one source listing and one destination writer
        let conns = (workers * 2).clamp(4, 64);
        let source_conns = *self.max_source_connections.get_or_insert(conns);
        let target_conns = *self.max_target_connections.get_or_insert(conns);

        info!(
            "Auto-tuned config: workers={}, source_conns={}, target_conns={}",
            workers, source_conns, target_conns
        );

        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_max_source_connections(&self) -> usize {
        self.max_source_connections.unwrap_or(8)
    }

    pub fn get_max_target_connections(&self) -> usize {
        self.max_target_connections.unwrap_or(8)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Deletion replay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Events fetched per deletion-log query.
    #[serde(default = "default_page_size")]
    pub batch_size: usize,

    /// Applied events between checkpoint writes (1 = after every event).
    #[serde(default = "default_checkpoint_buffer")]
    pub checkpoint_buffer: usize,

    /// Checkpoint name.
    #[serde(default = "default_job_name")]
    pub job_name: String,

    /// Identifier of the deletion log stored alongside the checkpoint.
    #[serde(default = "default_source_id")]
    pub source_id: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            batch_size: default_page_size(),
            checkpoint_buffer: default_checkpoint_buffer(),
            job_name: default_job_name(),
            source_id: default_source_id(),
        }
    }
}

// Default value functions for serde
fn default_mssql_port() -> u16 {
    1433
}

fn default_pg_port() -> u16 {
    5432
}

fn default_true_string() -> String {
    "true".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_root_uri() -> String {
    "vos://cadc.nrc.ca!vault".to_string()
}

fn default_vospace_schema() -> String {
    "vospace".to_string()
}

fn default_page_size() -> usize {
    1000
}

fn default_queue_capacity() -> usize {
    2000
}

fn default_poll_interval() -> u64 {
    6
}

fn default_checkpoint_buffer() -> usize {
    1
}

fn default_job_name() -> String {
    "migrate-deletions".to_string()
}

fn default_source_id() -> String {
    "db:mssql:vospace".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tuning_respects_explicit_values() {
        let resources = SystemResources {
            total_memory_gb: 16.0,
            cpu_cores: 12,
        };
        let tuned = MigrationConfig {
            workers: Some(5),
            ..Default::default()
        }
        .with_auto_tuning(&resources);
        assert_eq!(tuned.workers, Some(5));
        assert_eq!(tuned.max_source_connections, Some(10));
        assert_eq!(tuned.max_target_connections, Some(10));
    }

    #[test]
    fn test_auto_tuning_small_machine() {
        let resources = SystemResources {
            total_memory_gb: 2.0,
            cpu_cores: 1,
        };
        let tuned = MigrationConfig::default().with_auto_tuning(&resources);
        assert_eq!(tuned.workers, Some(2));
        assert_eq!(tuned.max_source_connections, Some(4));
    }
}
