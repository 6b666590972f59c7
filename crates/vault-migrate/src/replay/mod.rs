//! Checkpointed replay of the source deletion log.
//!
//! [`DeletedEventIterator`] pages through the log by timestamp. Because the
//! log can only be queried with `timestamp >= t`, each page re-reads the
//! rows at the cursor's timestamp; rows at or before the cursor position
//! (timestamp, id) are dropped.
//!
//! [`DeletionReplayer`] applies each event as a delete in the destination and
//! moves the persisted [`HarvestState`] forward. Delivery is at-least-once: a
//! crash between a delete and the next checkpoint write re-applies the events
//! since that write, and deletes are idempotent.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{DeletedNodeEvent, DeletionLog, DestinationStore};
use crate::error::{MigrateError, Result};
use crate::state::{CheckpointWriter, HarvestState};

/// Largest page requested while widening past events that share a timestamp.
const MAX_TIE_PAGE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Next fetch starts at this cursor (`None` = beginning of the log).
    At(Option<(DateTime<Utc>, Uuid)>),
    Exhausted,
}

/// Resumable iterator over the deletion log.
pub struct DeletedEventIterator {
    log: Arc<dyn DeletionLog>,
    batch_size: usize,
    batch: VecDeque<DeletedNodeEvent>,
    position: Position,
    queries: usize,
}

impl DeletedEventIterator {
    /// Start after `cursor`, or at the beginning of the log.
    pub fn new(
        log: Arc<dyn DeletionLog>,
        cursor: Option<(DateTime<Utc>, Uuid)>,
        batch_size: usize,
    ) -> Self {
        Self {
            log,
            batch_size: batch_size.max(2),
            batch: VecDeque::new(),
            position: Position::At(cursor),
            queries: 0,
        }
    }

    /// Number of log queries issued.
    pub fn queries(&self) -> usize {
        self.queries
    }

    pub fn is_exhausted(&self) -> bool {
        self.position == Position::Exhausted && self.batch.is_empty()
    }

    pub async fn next(&mut self) -> Result<Option<DeletedNodeEvent>> {
        loop {
            if let Some(event) = self.batch.pop_front() {
                self.position = Position::At(Some(event.position()));
                return Ok(Some(event));
            }
            match self.position {
                Position::Exhausted => return Ok(None),
                Position::At(cursor) => self.fetch(cursor).await?,
            }
        }
    }

    async fn fetch(&mut self, cursor: Option<(DateTime<Utc>, Uuid)>) -> Result<()> {
        let mut limit = self.batch_size;
        loop {
            let events = self
                .log
                .deleted_events(cursor.map(|(ts, _)| ts), limit)
                .await?;
            self.queries += 1;

            let fetched = events.len();
            let fresh: VecDeque<_> = events
                .into_iter()
                .filter(|e| cursor.map_or(true, |c| e.position() > c))
                .collect();
            debug!(
                "deletion log page: fetched {} new {} limit {} cursor {:?}",
                fetched,
                fresh.len(),
                limit,
                cursor
            );

            if !fresh.is_empty() {
                self.batch = fresh;
                return Ok(());
            }
            if fetched < limit {
                self.position = Position::Exhausted;
                return Ok(());
            }

            // A full page of rows at or before the cursor: widen past the tie group.
            if limit >= MAX_TIE_PAGE {
                return Err(MigrateError::Replay(format!(
                    "more than {} events share the cursor timestamp {:?}",
                    MAX_TIE_PAGE,
                    cursor.map(|(ts, _)| ts)
                )));
            }
            limit = (limit * 2).min(MAX_TIE_PAGE);
            debug!("deletion log page held only tied rows, retrying with limit {}", limit);
        }
    }
}

/// Replay options.
#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub batch_size: usize,
    /// Applied events between checkpoint writes.
    pub checkpoint_buffer: usize,
    pub job_name: String,
    pub source_id: String,
    /// Log what would be deleted; touch neither nodes nor the checkpoint.
    pub dry_run: bool,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            checkpoint_buffer: 1,
            job_name: "migrate-deletions".to_string(),
            source_id: "db:mssql:vospace".to_string(),
            dry_run: false,
        }
    }
}

/// Result of a replay run.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
    pub job_name: String,
    /// "completed" or "cancelled".
    pub status: String,
    pub dry_run: bool,
    pub events_seen: u64,
    pub events_applied: u64,
    pub cursor_last_modified: Option<DateTime<Utc>>,
    pub cursor_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl ReplayResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Applies deletion events from the source log to the destination.
pub struct DeletionReplayer {
    log: Arc<dyn DeletionLog>,
    dest: Arc<dyn DestinationStore>,
    settings: ReplaySettings,
}

impl DeletionReplayer {
    pub fn new(
        log: Arc<dyn DeletionLog>,
        dest: Arc<dyn DestinationStore>,
        settings: ReplaySettings,
    ) -> Self {
        Self {
            log,
            dest,
            settings,
        }
    }

    /// Replay from the stored checkpoint to the end of the log.
    ///
    /// On error the checkpoint still describes the last applied event, so a
    /// later run resumes from there.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ReplayResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let s = &self.settings;

        let state = self
            .dest
            .harvest_state(&s.job_name, &s.source_id)
            .await?;
        match state.cursor() {
            Some((ts, id)) => info!("{}: resuming after {} {}", s.job_name, ts, id),
            None => info!("{}: starting at beginning of deletion log", s.job_name),
        }

        let mut iter = DeletedEventIterator::new(self.log.clone(), state.cursor(), s.batch_size);
        let mut writer = CheckpointWriter::new(self.dest.clone(), state, s.checkpoint_buffer);
        let mut seen = 0u64;
        let mut applied = 0u64;

        let outcome: Result<()> = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(MigrateError::Cancelled),
                next = iter.next() => next,
            };
            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            seen += 1;

            if s.dry_run {
                info!(
                    "dry-run: delete {} {} {}",
                    event.node_type, event.id, event.last_modified
                );
                continue;
            }

            if let Err(e) = self.dest.delete(event.id).await {
                break Err(e);
            }
            applied += 1;
            debug!("deleted {} {} {}", event.node_type, event.id, event.last_modified);

            if let Err(e) = writer.record(&event).await {
                break Err(e);
            }
        };

        let flushed = writer.flush().await;
        let (cursor_last_modified, cursor_id) = cursor_of(writer.state());

        let status = match outcome {
            Ok(()) => "completed",
            Err(MigrateError::Cancelled) => "cancelled",
            Err(e) => {
                if let Err(fe) = flushed {
                    warn!("checkpoint flush after failure also failed: {}", fe);
                }
                return Err(MigrateError::Replay(format!(
                    "{} after {} applied events (checkpoint {:?} {:?}): {}",
                    s.job_name, applied, cursor_last_modified, cursor_id, e
                )));
            }
        };
        flushed.map_err(|e| MigrateError::Replay(format!("checkpoint flush failed: {}", e)))?;

        let result = ReplayResult {
            job_name: s.job_name.clone(),
            status: status.to_string(),
            dry_run: s.dry_run,
            events_seen: seen,
            events_applied: applied,
            cursor_last_modified,
            cursor_id,
            started_at,
            completed_at: Utc::now(),
            duration_seconds: start.elapsed().as_secs_f64(),
        };
        info!(
            "{} {}: {} events seen, {} applied in {:.1}s ({} log queries)",
            result.job_name,
            result.status,
            result.events_seen,
            result.events_applied,
            result.duration_seconds,
            iter.queries()
        );
        Ok(result)
    }
}

fn cursor_of(state: &HarvestState) -> (Option<DateTime<Utc>>, Option<Uuid>) {
    (state.cur_last_modified, state.cur_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{node_id, NodeType};
    use crate::memory::{MemoryDestination, MemorySource};
    use chrono::TimeZone;

    fn event(row: i64, secs: i64) -> DeletedNodeEvent {
        DeletedNodeEvent {
            id: node_id(row),
            node_type: NodeType::Data,
            last_modified: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn log(events: &[(i64, i64)]) -> Arc<MemorySource> {
        let mut src = MemorySource::new("vos://test!vault");
        for (row, secs) in events {
            src.add_deleted(event(*row, *secs));
        }
        Arc::new(src)
    }

    async fn drain(it: &mut DeletedEventIterator) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(e) = it.next().await.unwrap() {
            out.push(e.id.as_u128() as i64);
        }
        out
    }

    #[tokio::test]
    async fn test_iterator_skips_boundary_rows() {
        let src = log(&[(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)]);
        let mut it = DeletedEventIterator::new(src, None, 2);
        assert_eq!(drain(&mut it).await, vec![1, 2, 3, 4, 5]);
        assert!(it.is_exhausted());
    }

    #[tokio::test]
    async fn test_iterator_handles_timestamp_ties() {
        let src = log(&[(1, 1), (2, 1), (3, 1), (4, 2)]);
        let mut it = DeletedEventIterator::new(src, None, 4);
        assert_eq!(drain(&mut it).await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_iterator_resumes_after_cursor() {
        let src = log(&[(1, 1), (2, 2), (3, 3)]);
        let cursor = Some(event(2, 2).position());
        let mut it = DeletedEventIterator::new(src, cursor, 10);
        assert_eq!(drain(&mut it).await, vec![3]);
    }

    #[tokio::test]
    async fn test_iterator_empty_log() {
        let src = log(&[]);
        let mut it = DeletedEventIterator::new(src, None, 10);
        assert!(it.next().await.unwrap().is_none());
        assert_eq!(it.queries(), 1);
    }

    #[tokio::test]
    async fn test_iterator_ties_filling_a_page() {
        let src = log(&[(1, 1), (2, 1), (3, 2)]);
        let mut it = DeletedEventIterator::new(src, None, 2);
        assert_eq!(drain(&mut it).await, vec![1, 2, 3]);
        assert!(it.is_exhausted());
    }

    #[tokio::test]
    async fn test_iterator_ties_beyond_a_page() {
        let src = log(&[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1), (6, 2), (7, 3)]);
        let mut it = DeletedEventIterator::new(src, None, 2);
        assert_eq!(drain(&mut it).await, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_iterator_resumes_inside_tie_group() {
        let src = log(&[(1, 1), (2, 1), (3, 1), (4, 2)]);
        let cursor = Some(event(2, 1).position());
        let mut it = DeletedEventIterator::new(src, cursor, 2);
        assert_eq!(drain(&mut it).await, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_replay_applies_and_checkpoints() {
        let src = log(&[(1, 1), (2, 2), (3, 3)]);
        let dest = Arc::new(MemoryDestination::new(Uuid::nil()));
        let replayer = DeletionReplayer::new(src, dest.clone(), ReplaySettings::default());

        let result = replayer.run(CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, "completed");
        assert_eq!(result.events_applied, 3);
        assert_eq!(result.cursor_id, Some(node_id(3)));
        assert_eq!(dest.deleted(), vec![node_id(1), node_id(2), node_id(3)]);
        assert_eq!(dest.state_writes(), 3);

        // a second run finds nothing new
        let again = replayer.run(CancellationToken::new()).await.unwrap();
        assert_eq!(again.events_applied, 0);
        assert_eq!(dest.deleted().len(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_checkpoint_alone() {
        let src = log(&[(1, 1), (2, 2)]);
        let dest = Arc::new(MemoryDestination::new(Uuid::nil()));
        let settings = ReplaySettings {
            dry_run: true,
            ..Default::default()
        };
        let result = DeletionReplayer::new(src, dest.clone(), settings)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.events_seen, 2);
        assert_eq!(result.events_applied, 0);
        assert!(dest.deleted().is_empty());
        assert_eq!(dest.state_writes(), 0);
    }

    #[tokio::test]
    async fn test_buffered_checkpoint_flushed_on_failure() {
        let src = log(&[(1, 1), (2, 2), (3, 3), (4, 4)]);
        let dest = Arc::new(MemoryDestination::new(Uuid::nil()).fail_deletes_after(3));
        let settings = ReplaySettings {
            checkpoint_buffer: 100,
            ..Default::default()
        };
        let err = DeletionReplayer::new(src, dest.clone(), settings)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);

        let state = dest.harvest_state("migrate-deletions", "x").await.unwrap();
        assert_eq!(state.cur_id, Some(node_id(3)));
        assert_eq!(dest.state_writes(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_replay_reports_status() {
        let src = log(&[(1, 1)]);
        let dest = Arc::new(MemoryDestination::new(Uuid::nil()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = DeletionReplayer::new(src, dest.clone(), ReplaySettings::default())
            .run(cancel)
            .await
            .unwrap();
        assert_eq!(result.status, "cancelled");
        assert!(dest.deleted().is_empty());
    }
}
