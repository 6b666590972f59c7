//! # vault-migrate
//!
//! Streaming migration of a VOSpace node tree from the legacy MSSQL node
//! store to the PostgreSQL node store.
//!
//! - **Paginated tree walk** with an explicit stack, so neither namespace
//!   size nor depth is bounded by memory or call-stack depth
//! - **Bounded pipeline** between source reads and destination writes
//! - **Parallel subtree jobs** on a fixed worker pool
//! - **Dry-run** mode that reads and translates without writing
//! - **Resumable deletion replay** driven by a persisted checkpoint
//!
//! ## Example
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use vault_migrate::{Config, MigrateOptions, Migrator};
//!
//! #[tokio::main]
//! async fn main() -> vault_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let migrator = Migrator::connect(config).await?;
//!     let options = MigrateOptions {
//!         recursive: true,
//!         ..Default::default()
//!     };
//!     let result = migrator.run(options, CancellationToken::new()).await?;
//!     println!("Migrated {} nodes", result.nodes_migrated);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod pipeline;
pub mod replay;
pub mod source;
pub mod state;
pub mod target;
pub mod translate;
pub mod walker;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, ReplayConfig, SourceConfig, TargetConfig};
pub use error::{MigrateError, Result};
pub use orchestrator::{HealthCheckResult, MigrateOptions, MigrationResult, Migrator};
pub use pipeline::{JobResult, JobSettings, JobStatus, MigrationJob, WriteStats};
pub use replay::{DeletionReplayer, ReplayResult, ReplaySettings};
pub use source::MssqlNodeSource;
pub use state::HarvestState;
pub use target::PgNodeStore;
pub use translate::NodeTranslator;
pub use walker::TreeIterator;
