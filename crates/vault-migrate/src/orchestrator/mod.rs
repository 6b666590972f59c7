//! Migration orchestrator - top-level driver.
//!
//! Migrates the top-level nodes (every child of the root, or an explicit
//! list) one at a time, and hands each top-level container's subtree to the
//! [`JobScheduler`] when running recursively. Deletion replay is a separate
//! entry point and never runs alongside a migration.

pub mod scheduler;

pub use scheduler::{JobScheduler, SchedulerReport};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{DeletionLog, DestinationStore, PropertyCache, SourceNode, SourceStore};
use crate::error::{MigrateError, Result};
use crate::pipeline::{JobSettings, JobStatus, MigrationJob, WriteStats};
use crate::replay::{DeletionReplayer, ReplayResult, ReplaySettings};
use crate::source::MssqlNodeSource;
use crate::target::PgNodeStore;
use crate::translate::NodeTranslator;
use crate::walker::TreeIterator;

/// Migration orchestrator.
pub struct Migrator {
    config: Config,
    source: Arc<dyn SourceStore>,
    deletions: Arc<dyn DeletionLog>,
    dest: Arc<dyn DestinationStore>,
}

/// Per-invocation options, usually taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Top-level node names to migrate. Empty means every child of the root.
    pub nodes: Vec<String>,
    /// Also migrate the subtree below each top-level container.
    pub recursive: bool,
    /// Read and translate, but never write.
    pub dry_run: bool,
    /// Overrides `migration.workers`.
    pub workers: Option<usize>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// "completed", "failed" or "cancelled".
    pub status: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    pub dry_run: bool,
    pub recursive: bool,

    /// Top-level nodes translated (and written, unless dry-run).
    pub top_level_nodes: usize,

    pub jobs_total: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    pub jobs_cancelled: usize,

    /// Every node translated, top-level nodes included.
    pub nodes_migrated: u64,

    pub nodes_per_second: f64,

    /// ACL entries and property keys dropped during translation.
    pub skipped_items: usize,

    /// Paths of failed top-level nodes and subtree jobs.
    pub failed_jobs: Vec<String>,

    pub write_stats: WriteStats,
}

impl MigrationResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Connectivity of both stores.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source_type: String,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_type: String,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
}

/// Outcome of the top-level loop.
#[derive(Default)]
struct TopLevel {
    count: usize,
    nodes: u64,
    skipped_items: usize,
    write_stats: WriteStats,
    failed: Vec<String>,
}

impl Migrator {
    /// Connect to both stores described by `config`.
    pub async fn connect(config: Config) -> Result<Self> {
        let source_conns = config.migration.get_max_source_connections() as u32;
        let source = Arc::new(MssqlNodeSource::connect(config.source.clone(), source_conns).await?);

        let target_conns = config.migration.get_max_target_connections();
        let target = PgNodeStore::connect(&config.target, target_conns).await?;
        target.init_schema().await?;

        Ok(Self {
            source: source.clone(),
            deletions: source,
            dest: Arc::new(target),
            config,
        })
    }

    /// Build a migrator over already-constructed stores.
    pub fn with_stores(
        config: Config,
        source: Arc<dyn SourceStore>,
        deletions: Arc<dyn DeletionLog>,
        dest: Arc<dyn DestinationStore>,
    ) -> Self {
        Self {
            config,
            source,
            deletions,
            dest,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ping both stores.
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let source = self.source.ping().await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target = self.dest.ping().await;
        let target_latency_ms = start.elapsed().as_millis() as u64;

        HealthCheckResult {
            healthy: source.is_ok() && target.is_ok(),
            source_type: self.source.store_type().to_string(),
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            target_type: self.dest.store_type().to_string(),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
        }
    }

    /// Run a migration.
    ///
    /// Named nodes are resolved before anything is written; a missing name
    /// fails the run with [`MigrateError::NodeNotFound`]. A top-level node
    /// that cannot be translated or written is recorded as failed and the
    /// run carries on with its siblings.
    pub async fn run(
        &self,
        options: MigrateOptions,
        cancel: CancellationToken,
    ) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mig = &self.config.migration;
        let workers = options.workers.unwrap_or_else(|| mig.get_workers());

        info!(
            "Starting migration run {} (recursive={}, dry_run={}, workers={})",
            run_id, options.recursive, options.dry_run, workers
        );

        let property_cache = if mig.property_cache {
            Some(Arc::new(self.source.property_cache().await?))
        } else {
            None
        };

        let root = self.source.root().await?;
        let translator = NodeTranslator::new(self.dest.root_id());

        let explicit = if options.nodes.is_empty() {
            None
        } else {
            let mut resolved = Vec::with_capacity(options.nodes.len());
            for name in &options.nodes {
                let mut node = self
                    .source
                    .child(&root, name)
                    .await?
                    .ok_or_else(|| MigrateError::NodeNotFound(root.child_path(name)))?;
                self.attach_properties(&mut node, property_cache.as_deref())
                    .await?;
                resolved.push(node);
            }
            Some(resolved)
        };

        let job_settings = JobSettings {
            page_size: mig.page_size,
            queue_capacity: mig.queue_capacity,
            dry_run: options.dry_run,
        };
        let progress = Arc::new(AtomicU64::new(0));
        let jobs_cancel = cancel.child_token();
        let mut scheduler = JobScheduler::start(workers, mig.poll_interval(), &jobs_cancel);
        let mut top = TopLevel::default();

        let mut listing = explicit.is_none().then(|| {
            let iter = TreeIterator::new(self.source.clone(), root.clone(), mig.page_size).shallow();
            match &property_cache {
                Some(cache) => iter.with_property_cache(cache.clone()),
                None => iter,
            }
        });
        let mut explicit = explicit.map(Vec::into_iter);

        let outcome: Result<()> = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            let next = match (&mut explicit, &mut listing) {
                (Some(nodes), _) => nodes.next(),
                (None, Some(iter)) => match iter.next().await {
                    Ok(node) => node,
                    Err(e) => break Err(e),
                },
                (None, None) => None,
            };
            let Some(node) = next else {
                break Ok(());
            };

            match self
                .migrate_top_level(&node, &translator, options.dry_run, &progress, &mut top)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_per_job() => {
                    error!("failed at {}: {}", node.path, e);
                    top.failed.push(node.path.clone());
                    continue;
                }
                Err(e) => break Err(e),
            }

            if options.recursive && node.is_container() {
                let mut job = MigrationJob::new(
                    node.as_container(),
                    self.source.clone(),
                    self.dest.clone(),
                    translator.clone(),
                    job_settings.clone(),
                )
                .with_progress(progress.clone());
                if let Some(cache) = &property_cache {
                    job = job.with_property_cache(cache.clone());
                }
                if let Err(e) = scheduler.submit(job) {
                    break Err(e);
                }
                debug!(
                    "subtree jobs submitted: {} waiting: {} busy workers: {}",
                    scheduler.submitted(),
                    scheduler.queued(),
                    scheduler.busy()
                );
            }
        };

        if let Err(e) = outcome {
            error!("aborting run {}: {}", run_id, e);
            jobs_cancel.cancel();
            scheduler.finish().await;
            return Err(e);
        }

        let report = scheduler.finish().await;
        let result = aggregate(run_id, started_at, start, &options, top, report, &cancel);
        log_result(&result);
        Ok(result)
    }

    async fn attach_properties(
        &self,
        node: &mut SourceNode,
        cache: Option<&PropertyCache>,
    ) -> Result<()> {
        match cache {
            Some(cache) => {
                if let Some(props) = cache.get(&node.row_id) {
                    node.properties.extend(props.iter().cloned());
                }
            }
            None => {
                let props = self.source.properties(node).await?;
                node.properties.extend(props);
            }
        }
        Ok(())
    }

    async fn migrate_top_level(
        &self,
        node: &SourceNode,
        translator: &NodeTranslator,
        dry_run: bool,
        progress: &AtomicU64,
        top: &mut TopLevel,
    ) -> Result<()> {
        let translation = translator.translate(node)?;
        if !dry_run {
            let put_start = Instant::now();
            self.dest.put(&translation.node).await?;
            top.write_stats.record(put_start.elapsed());
        }
        top.count += 1;
        top.nodes += 1;
        top.skipped_items += translation.skipped.len();

        let n = progress.fetch_add(1, Ordering::Relaxed) + 1;
        info!("{} {} {}", n, node.kind_name(), node.path);
        Ok(())
    }

    /// Replay the source deletion log into the destination.
    pub async fn replay_deletions(
        &self,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Result<ReplayResult> {
        let r = &self.config.replay;
        let settings = ReplaySettings {
            batch_size: r.batch_size,
            checkpoint_buffer: r.checkpoint_buffer,
            job_name: r.job_name.clone(),
            source_id: r.source_id.clone(),
            dry_run,
        };
        DeletionReplayer::new(self.deletions.clone(), self.dest.clone(), settings)
            .run(cancel)
            .await
    }
}

fn aggregate(
    run_id: String,
    started_at: DateTime<Utc>,
    start: Instant,
    options: &MigrateOptions,
    top: TopLevel,
    report: SchedulerReport,
    cancel: &CancellationToken,
) -> MigrationResult {
    let mut write_stats = top.write_stats;
    let mut nodes = top.nodes;
    let mut skipped_items = top.skipped_items;
    let mut failed_jobs = top.failed;
    let (mut succeeded, mut failed, mut cancelled) = (0, 0, 0);

    for job in &report.results {
        write_stats.merge(&job.write_stats);
        nodes += job.nodes;
        skipped_items += job.skipped_items;
        match job.status {
            JobStatus::Completed => succeeded += 1,
            JobStatus::Failed => {
                failed += 1;
                failed_jobs.push(job.container.clone());
            }
            JobStatus::Cancelled => cancelled += 1,
        }
    }
    if report.lost_workers > 0 {
        warn!("{} job workers did not report", report.lost_workers);
    }

    let status = if cancel.is_cancelled() || cancelled > 0 {
        "cancelled"
    } else if !failed_jobs.is_empty() || report.lost_workers > 0 {
        "failed"
    } else {
        "completed"
    };

    let elapsed = start.elapsed().as_secs_f64();
    MigrationResult {
        run_id,
        status: status.to_string(),
        started_at,
        completed_at: Utc::now(),
        duration_seconds: elapsed,
        dry_run: options.dry_run,
        recursive: options.recursive,
        top_level_nodes: top.count,
        jobs_total: report.submitted,
        jobs_succeeded: succeeded,
        jobs_failed: failed,
        jobs_cancelled: cancelled,
        nodes_migrated: nodes,
        nodes_per_second: if elapsed > 0.0 { nodes as f64 / elapsed } else { 0.0 },
        skipped_items,
        failed_jobs,
        write_stats,
    }
}

fn log_result(result: &MigrationResult) {
    info!(
        "Migration {}: {} nodes in {:.1}s ({:.1} nodes/sec), jobs {}/{} ok, {} failed, {} cancelled",
        result.status,
        result.nodes_migrated,
        result.duration_seconds,
        result.nodes_per_second,
        result.jobs_succeeded,
        result.jobs_total,
        result.jobs_failed,
        result.jobs_cancelled
    );
    for path in &result.failed_jobs {
        warn!("failed: {}", path);
    }
}
