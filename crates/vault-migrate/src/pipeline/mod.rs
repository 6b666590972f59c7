//! Bounded producer/consumer pipeline between the tree walk and the writer.
//!
//! - [`Pipeline`]: runs a [`TreeIterator`] on a background task and hands its
//!   output over a fixed-capacity channel
//! - [`MigrationJob`]: one subtree migration built on a pipeline
//!
//! The producer blocks when the channel is full, the consumer blocks when it
//! is empty. End of stream is an explicit [`PipelineItem::End`] marker; a
//! channel that closes without one means the producer died.

mod job;

pub use job::{JobResult, JobSettings, JobStatus, MigrationJob, WriteStats};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::SourceNode;
use crate::error::MigrateError;
use crate::walker::{IteratorStats, TreeIterator};

/// Interval between producer queue-depth reports.
const QUEUE_REPORT_INTERVAL: Duration = Duration::from_secs(120);

/// One message on the pipeline channel.
#[derive(Debug)]
pub enum PipelineItem {
    Node(SourceNode),
    /// The walk failed; nothing follows.
    Failed(MigrateError),
    /// The walk finished; nothing follows.
    End,
}

/// Consumer end of a running pipeline.
pub struct Pipeline {
    rx: mpsc::Receiver<PipelineItem>,
    producer: JoinHandle<IteratorStats>,
    stop: CancellationToken,
    produced: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
    capacity: usize,
}

impl Pipeline {
    /// Start producing from `iter` into a channel of `capacity` slots.
    ///
    /// The producer also stops when `cancel` fires.
    pub fn spawn(iter: TreeIterator, capacity: usize, cancel: &CancellationToken) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let stop = cancel.child_token();
        let produced = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let producer = tokio::spawn(produce(
            iter,
            tx,
            stop.clone(),
            produced.clone(),
            high_water.clone(),
        ));

        Self {
            rx,
            producer,
            stop,
            produced,
            high_water,
            capacity,
        }
    }

    /// Wait for the next item.
    ///
    /// A channel closed without an end marker is reported as
    /// [`PipelineItem::Failed`].
    pub async fn recv(&mut self) -> PipelineItem {
        match self.rx.recv().await {
            Some(item) => item,
            None => PipelineItem::Failed(MigrateError::Pipeline(
                "producer stopped without end-of-stream marker".into(),
            )),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Nodes the producer has queued so far.
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::Relaxed)
    }

    /// Most items ever observed waiting in the channel.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Stop the producer and collect its traversal stats.
    pub async fn finish(self) -> IteratorStats {
        self.stop.cancel();
        drop(self.rx);
        match self.producer.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("pipeline producer task failed: {}", e);
                IteratorStats::default()
            }
        }
    }
}

async fn produce(
    mut iter: TreeIterator,
    tx: mpsc::Sender<PipelineItem>,
    stop: CancellationToken,
    produced: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
) -> IteratorStats {
    let mut last_report = Instant::now();

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = iter.next() => next,
        };
        let (item, last) = match next {
            Ok(Some(node)) => (PipelineItem::Node(node), false),
            Ok(None) => (PipelineItem::End, true),
            Err(e) => (PipelineItem::Failed(e), true),
        };

        let sent = tokio::select! {
            _ = stop.cancelled() => false,
            r = tx.send(item) => r.is_ok(),
        };
        if !sent || last {
            break;
        }

        let n = produced.fetch_add(1, Ordering::Relaxed) + 1;
        let queued = tx.max_capacity() - tx.capacity();
        high_water.fetch_max(queued, Ordering::Relaxed);

        if last_report.elapsed() >= QUEUE_REPORT_INTERVAL {
            info!("queueSize: {} produced: {}", queued, n);
            last_report = Instant::now();
        }
    }

    iter.into_stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SourceStore;
    use crate::memory::MemorySource;

    async fn source(n: i64) -> (Arc<MemorySource>, TreeIterator) {
        let mut src = MemorySource::new("vos://test!vault");
        for i in 0..n {
            src.add_data(None, i + 1, &format!("f{:04}", i)).unwrap();
        }
        let src = Arc::new(src);
        let root = src.root().await.unwrap();
        let it = TreeIterator::new(src.clone(), root, 7);
        (src, it)
    }

    #[tokio::test]
    async fn test_end_marker_after_all_nodes() {
        let (_src, it) = source(20).await;
        let cancel = CancellationToken::new();
        let mut p = Pipeline::spawn(it, 4, &cancel);

        let mut nodes = 0;
        loop {
            match p.recv().await {
                PipelineItem::Node(_) => nodes += 1,
                PipelineItem::End => break,
                PipelineItem::Failed(e) => panic!("unexpected failure: {}", e),
            }
        }
        assert_eq!(nodes, 20);
        assert_eq!(p.produced(), 20);
        let stats = p.finish().await;
        assert_eq!(stats.yielded, 20);
    }

    #[tokio::test]
    async fn test_queue_never_exceeds_capacity() {
        let (_src, it) = source(50).await;
        let cancel = CancellationToken::new();
        let mut p = Pipeline::spawn(it, 5, &cancel);

        // let the producer fill the queue before consuming
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut nodes = 0;
        while let PipelineItem::Node(_) = p.recv().await {
            nodes += 1;
            tokio::task::yield_now().await;
        }
        assert_eq!(nodes, 50);
        assert!(p.high_water() <= p.capacity());
        assert!(p.high_water() > 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_producer() {
        let (_src, it) = source(100).await;
        let cancel = CancellationToken::new();
        let mut p = Pipeline::spawn(it, 2, &cancel);
        assert!(matches!(p.recv().await, PipelineItem::Node(_)));

        cancel.cancel();
        let stats = p.finish().await;
        assert!(stats.yielded < 100);
    }
}
