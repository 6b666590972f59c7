//! Subtree migration job.
//!
//! A [`MigrationJob`] walks one container's descendants through a
//! [`Pipeline`], translates each node and writes it to the destination.
//! Write latencies are collected in a [`WriteStats`] owned by the job and
//! returned in its [`JobResult`]; callers merge results instead of sharing
//! counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Pipeline, PipelineItem};
use crate::core::{ContainerRef, DestinationStore, PropertyCache, SourceNode, SourceStore};
use crate::error::{MigrateError, Result};
use crate::translate::NodeTranslator;
use crate::walker::{IteratorStats, TreeIterator};

/// Put-latency accumulator (microsecond resolution).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub count: u64,
    pub total_us: u64,
    pub min_us: Option<u64>,
    pub max_us: u64,
}

impl WriteStats {
    pub fn record(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.count += 1;
        self.total_us = self.total_us.saturating_add(us);
        self.min_us = Some(self.min_us.map_or(us, |m| m.min(us)));
        self.max_us = self.max_us.max(us);
    }

    pub fn merge(&mut self, other: &WriteStats) {
        self.count += other.count;
        self.total_us = self.total_us.saturating_add(other.total_us);
        self.min_us = match (self.min_us, other.min_us) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_us = self.max_us.max(other.max_us);
    }

    pub fn min(&self) -> Duration {
        Duration::from_micros(self.min_us.unwrap_or(0))
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_us)
    }

    pub fn total(&self) -> Duration {
        Duration::from_micros(self.total_us)
    }

    pub fn avg(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.total_us / self.count)
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Per-job tuning shared by every job of a run.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub page_size: usize,
    pub queue_capacity: usize,
    /// Read and translate, but never write.
    pub dry_run: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            page_size: 1000,
            queue_capacity: 2000,
            dry_run: false,
        }
    }
}

/// Outcome of one subtree job.
#[derive(Debug, Clone)]
pub struct JobResult {
    /// Path of the subtree root.
    pub container: String,
    pub status: JobStatus,
    /// Nodes translated (and written, unless dry-run).
    pub nodes: u64,
    /// ACL entries and property keys dropped during translation.
    pub skipped_items: usize,
    pub write_stats: WriteStats,
    pub traversal: IteratorStats,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl JobResult {
    /// Nodes per second over the whole job.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.nodes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Migration of every descendant of one container.
pub struct MigrationJob {
    container: ContainerRef,
    source: Arc<dyn SourceStore>,
    dest: Arc<dyn DestinationStore>,
    translator: NodeTranslator,
    settings: JobSettings,
    property_cache: Option<Arc<PropertyCache>>,
    progress: Option<Arc<AtomicU64>>,
}

impl MigrationJob {
    pub fn new(
        container: ContainerRef,
        source: Arc<dyn SourceStore>,
        dest: Arc<dyn DestinationStore>,
        translator: NodeTranslator,
        settings: JobSettings,
    ) -> Self {
        Self {
            container,
            source,
            dest,
            translator,
            settings,
            property_cache: None,
            progress: None,
        }
    }

    pub fn with_property_cache(mut self, cache: Arc<PropertyCache>) -> Self {
        self.property_cache = Some(cache);
        self
    }

    /// Run-wide node counter used for progress log lines.
    pub fn with_progress(mut self, counter: Arc<AtomicU64>) -> Self {
        self.progress = Some(counter);
        self
    }

    pub fn name(&self) -> &str {
        &self.container.path
    }

    /// Run to completion, failure or cancellation.
    ///
    /// Never returns an error: failures are reported in the result so that
    /// sibling jobs keep running.
    pub async fn run(self, cancel: CancellationToken) -> JobResult {
        let start = Instant::now();
        let path = self.container.path.clone();
        info!("start {}", path);

        let mut iter = TreeIterator::new(
            self.source.clone(),
            self.container.clone(),
            self.settings.page_size,
        );
        if let Some(cache) = &self.property_cache {
            iter = iter.with_property_cache(cache.clone());
        }
        let mut pipeline = Pipeline::spawn(iter, self.settings.queue_capacity, &cancel);

        let mut write_stats = WriteStats::default();
        let mut nodes = 0u64;
        let mut skipped_items = 0usize;

        let outcome: Result<()> = loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(MigrateError::Cancelled),
                item = pipeline.recv() => item,
            };
            match item {
                PipelineItem::End => break Ok(()),
                PipelineItem::Failed(e) => break Err(e),
                PipelineItem::Node(src) => {
                    match self.process(&src, &mut write_stats).await {
                        Ok(skipped) => {
                            nodes += 1;
                            skipped_items += skipped;
                        }
                        Err(e) => {
                            error!("failed at {}: {}", src.path, e);
                            break Err(e);
                        }
                    }
                }
            }
        };

        let traversal = pipeline.finish().await;
        let elapsed = start.elapsed();

        let (status, error) = match outcome {
            Ok(()) => (JobStatus::Completed, None),
            Err(MigrateError::Cancelled) => {
                debug!("cancelled {}", path);
                (JobStatus::Cancelled, None)
            }
            Err(e) => {
                error!("job {} failed: {}", path, e);
                (JobStatus::Failed, Some(e.to_string()))
            }
        };

        let result = JobResult {
            container: path,
            status,
            nodes,
            skipped_items,
            write_stats,
            traversal,
            elapsed,
            error,
        };
        log_summary(&result, self.settings.dry_run);
        result
    }

    /// Translate and write one node; returns the number of dropped items.
    async fn process(&self, src: &SourceNode, stats: &mut WriteStats) -> Result<usize> {
        let translation = self.translator.translate(src)?;

        if !self.settings.dry_run {
            let put_start = Instant::now();
            self.dest.put(&translation.node).await?;
            stats.record(put_start.elapsed());
        }

        let n = self
            .progress
            .as_ref()
            .map(|c| c.fetch_add(1, Ordering::Relaxed) + 1)
            .unwrap_or_default();
        info!("{} {} {}", n, src.kind_name(), src.path);
        Ok(translation.skipped.len())
    }
}

fn log_summary(result: &JobResult, dry_run: bool) {
    let ws = &result.write_stats;
    info!(
        "summary {} status={:?} count={} skipped={} total={:?} rate={:.1}/s dry_run={}",
        result.container,
        result.status,
        result.nodes,
        result.skipped_items,
        result.elapsed,
        result.rate(),
        dry_run
    );
    info!(
        "summary {} put_min={:?} put_max={:?} put_avg={:?} query_time={:?} queries={} max_pending={}",
        result.container,
        ws.min(),
        ws.max(),
        ws.avg(),
        result.traversal.query_time,
        result.traversal.page_queries,
        result.traversal.max_pending
    );
}
