//! Worker pool for subtree jobs.
//!
//! Jobs go into a shared queue as soon as they are submitted and a fixed
//! number of workers pull from it. [`JobScheduler::finish`] closes the queue
//! and resolves once every worker has drained it; a status line is logged on
//! each poll interval while waiting.

use async_channel::{Receiver, Sender};
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{MigrateError, Result};
use crate::pipeline::{JobResult, MigrationJob};

/// Everything the pool produced.
#[derive(Debug, Default)]
pub struct SchedulerReport {
    pub results: Vec<JobResult>,
    pub submitted: usize,
    /// Workers that died without reporting (panicked).
    pub lost_workers: usize,
    pub elapsed: Duration,
}

/// Counts a worker as busy until dropped, including on unwind.
struct BusyGuard(Arc<AtomicUsize>);

impl BusyGuard {
    fn enter(busy: &Arc<AtomicUsize>) -> Self {
        busy.fetch_add(1, Ordering::SeqCst);
        Self(busy.clone())
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fixed-size pool of job workers.
pub struct JobScheduler {
    tx: Sender<MigrationJob>,
    rx: Receiver<MigrationJob>,
    workers: Vec<JoinHandle<Vec<JobResult>>>,
    busy: Arc<AtomicUsize>,
    poll_interval: Duration,
    submitted: usize,
    started: Instant,
}

impl JobScheduler {
    /// Start `workers` workers. They idle until jobs are submitted.
    pub fn start(workers: usize, poll_interval: Duration, cancel: &CancellationToken) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = async_channel::unbounded::<MigrationJob>();
        let busy = Arc::new(AtomicUsize::new(0));

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let busy = busy.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut results = Vec::new();
                    while let Ok(job) = rx.recv().await {
                        let _busy = BusyGuard::enter(&busy);
                        debug!("worker {}: picked up {}", worker_id, job.name());
                        results.push(job.run(cancel.clone()).await);
                    }
                    debug!("worker {}: queue drained", worker_id);
                    results
                })
            })
            .collect();

        info!("job scheduler started with {} workers", workers);

        Self {
            tx,
            rx,
            workers: handles,
            busy,
            poll_interval: poll_interval.max(Duration::from_millis(10)),
            submitted: 0,
            started: Instant::now(),
        }
    }

    /// Queue a job.
    pub fn submit(&mut self, job: MigrationJob) -> Result<()> {
        let name = job.name().to_string();
        self.tx
            .try_send(job)
            .map_err(|e| MigrateError::job(name, format!("scheduler queue closed: {}", e)))?;
        self.submitted += 1;
        Ok(())
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Workers currently running a job.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Close the queue and wait until every submitted job has run.
    pub async fn finish(self) -> SchedulerReport {
        self.tx.close();

        let worker_count = self.workers.len();
        let joined = join_all(self.workers);
        tokio::pin!(joined);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await;

        let outcomes = loop {
            tokio::select! {
                outcomes = &mut joined => break outcomes,
                _ = ticker.tick() => {
                    info!(
                        "jobs queued: {} busy workers: {}/{}",
                        self.rx.len(),
                        self.busy.load(Ordering::SeqCst),
                        worker_count
                    );
                }
            }
        };

        let mut report = SchedulerReport {
            submitted: self.submitted,
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(results) => report.results.extend(results),
                Err(e) => {
                    error!("job worker panicked: {}", e);
                    report.lost_workers += 1;
                }
            }
        }
        report.elapsed = self.started.elapsed();
        info!(
            "job scheduler done: {} of {} jobs reported in {:?}",
            report.results.len(),
            report.submitted,
            report.elapsed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContainerRef, SourceKind, SourceStore};
    use crate::memory::{MemoryDestination, MemorySource};
    use crate::pipeline::{JobSettings, JobStatus};
    use crate::translate::NodeTranslator;
    use uuid::Uuid;

    async fn jobs(src: Arc<MemorySource>, dest: Arc<MemoryDestination>) -> Vec<MigrationJob> {
        let root = src.root().await.unwrap();
        let page = src.children_page(&root, None, 100).await.unwrap();
        page.into_iter()
            .filter(|n| n.is_container())
            .map(|n| {
                MigrationJob::new(
                    n.as_container(),
                    src.clone(),
                    dest.clone(),
                    NodeTranslator::new(Uuid::nil()),
                    JobSettings::default(),
                )
            })
            .collect()
    }

    fn source() -> MemorySource {
        let mut src = MemorySource::new("vos://test!vault");
        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let id = (i as i64 + 1) * 100;
            src.add_container(None, id, name).unwrap();
            for j in 1..=10 {
                src.add_data(Some(id), id + j, &format!("f{}", j)).unwrap();
            }
        }
        src
    }

    #[tokio::test]
    async fn test_all_jobs_complete() {
        let src = Arc::new(source());
        let dest = Arc::new(MemoryDestination::new(Uuid::nil()));
        let cancel = CancellationToken::new();
        let mut scheduler = JobScheduler::start(2, Duration::from_millis(20), &cancel);
        for job in jobs(src, dest.clone()).await {
            scheduler.submit(job).unwrap();
        }
        let report = scheduler.finish().await;
        assert_eq!(report.submitted, 5);
        assert_eq!(report.results.len(), 5);
        assert!(report
            .results
            .iter()
            .all(|r| r.status == JobStatus::Completed));
        assert_eq!(dest.len(), 50);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_stop_siblings() {
        let mut src = source();
        src.add_node(Some(300), 399, "broken", SourceKind::Other("X".into()))
            .unwrap();
        let src = Arc::new(src);
        let dest = Arc::new(MemoryDestination::new(Uuid::nil()));
        let cancel = CancellationToken::new();
        let mut scheduler = JobScheduler::start(3, Duration::from_millis(20), &cancel);
        for job in jobs(src, dest.clone()).await {
            scheduler.submit(job).unwrap();
        }
        let report = scheduler.finish().await;

        let failed: Vec<_> = report
            .results
            .iter()
            .filter(|r| r.status == JobStatus::Failed)
            .map(|r| r.container.as_str())
            .collect();
        assert_eq!(failed, vec!["vos://test!vault/c"]);
        let done = report
            .results
            .iter()
            .filter(|r| r.status == JobStatus::Completed)
            .count();
        assert_eq!(done, 4);
    }

    #[tokio::test]
    async fn test_busy_count_released_on_panic() {
        let busy = Arc::new(AtomicUsize::new(0));
        let counter = busy.clone();
        let handle = tokio::spawn(async move {
            let _busy = BusyGuard::enter(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 1);
            panic!("job blew up");
        });
        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(busy.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_counters_after_submit() {
        let src = Arc::new(source());
        let dest = Arc::new(MemoryDestination::new(Uuid::nil()));
        let cancel = CancellationToken::new();
        let mut scheduler = JobScheduler::start(1, Duration::from_millis(20), &cancel);
        for job in jobs(src, dest).await {
            scheduler.submit(job).unwrap();
        }
        assert_eq!(scheduler.submitted(), 5);
        assert!(scheduler.queued() + scheduler.busy() <= 5);
        let report = scheduler.finish().await;
        assert_eq!(report.results.len(), 5);
    }

    #[tokio::test]
    async fn test_finish_without_jobs() {
        let cancel = CancellationToken::new();
        let scheduler = JobScheduler::start(4, Duration::from_millis(20), &cancel);
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(scheduler.busy(), 0);
        let report = scheduler.finish().await;
        assert!(report.results.is_empty());
        assert_eq!(report.lost_workers, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_every_job() {
        let src = Arc::new(source());
        let dest = Arc::new(MemoryDestination::new(Uuid::nil()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut scheduler = JobScheduler::start(2, Duration::from_millis(20), &cancel);
        let job = MigrationJob::new(
            ContainerRef::root("vos://test!vault"),
            src.clone(),
            dest.clone(),
            NodeTranslator::new(Uuid::nil()),
            JobSettings::default(),
        );
        scheduler.submit(job).unwrap();
        let report = scheduler.finish().await;
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].status, JobStatus::Cancelled);
        assert_eq!(dest.put_count(), 0);
    }
}
