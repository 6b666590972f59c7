//! Replay checkpoint (harvest state) and its buffered writer.
//!
//! A [`HarvestState`] is a named cursor over the source deletion log:
//! (last processed timestamp, last processed id). It lives in the
//! destination store so that a replay can resume after a failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::core::{DeletedNodeEvent, DestinationStore};
use crate::error::Result;

/// Named, persisted replay cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestState {
    /// Replay job name (the checkpoint key).
    pub name: String,

    /// Identifier of the log being replayed.
    pub source: String,

    /// Timestamp of the last applied event.
    pub cur_last_modified: Option<DateTime<Utc>>,

    /// Id of the last applied event.
    pub cur_id: Option<Uuid>,

    /// When the checkpoint was last persisted.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl HarvestState {
    /// Create an empty checkpoint positioned before the first event.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            cur_last_modified: None,
            cur_id: None,
            updated_at: None,
        }
    }

    /// Current (timestamp, id) position, if any event was applied.
    pub fn cursor(&self) -> Option<(DateTime<Utc>, Uuid)> {
        match (self.cur_last_modified, self.cur_id) {
            (Some(ts), Some(id)) => Some((ts, id)),
            _ => None,
        }
    }

    /// Move the cursor to `event`. The cursor only moves forward; returns
    /// false when `event` is not after the current position.
    pub fn advance(&mut self, event: &DeletedNodeEvent) -> bool {
        if let Some(cur) = self.cursor() {
            if event.position() <= cur {
                return false;
            }
        }
        self.cur_last_modified = Some(event.last_modified);
        self.cur_id = Some(event.id);
        true
    }
}

/// Writes checkpoint updates to the destination every `buffer` advances.
///
/// `flush` must be called on every exit path; anything recorded since the
/// last flush is otherwise re-applied on the next run.
pub struct CheckpointWriter {
    dest: Arc<dyn DestinationStore>,
    state: HarvestState,
    buffer: usize,
    pending: usize,
}

impl CheckpointWriter {
    pub fn new(dest: Arc<dyn DestinationStore>, state: HarvestState, buffer: usize) -> Self {
        Self {
            dest,
            state,
            buffer: buffer.max(1),
            pending: 0,
        }
    }

    pub fn state(&self) -> &HarvestState {
        &self.state
    }

    /// Number of advances not yet persisted.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Advance to `event`, persisting when the buffer is full.
    pub async fn record(&mut self, event: &DeletedNodeEvent) -> Result<()> {
        if self.state.advance(event) {
            self.pending += 1;
            if self.pending >= self.buffer {
                self.flush().await?;
            }
        }
        Ok(())
    }

    /// Persist any buffered advance.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        self.state.updated_at = Some(Utc::now());
        self.dest.put_harvest_state(&self.state).await?;
        debug!(
            "checkpoint {}: {:?} {:?}",
            self.state.name, self.state.cur_last_modified, self.state.cur_id
        );
        self.pending = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{node_id, NodeType};
    use crate::memory::MemoryDestination;
    use chrono::TimeZone;

    fn event(row: i64, secs: i64) -> DeletedNodeEvent {
        DeletedNodeEvent {
            id: node_id(row),
            node_type: NodeType::Data,
            last_modified: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut state = HarvestState::new("migrate-deletions", "db:test");
        assert!(state.cursor().is_none());

        assert!(state.advance(&event(1, 10)));
        assert_eq!(state.cur_id, Some(node_id(1)));

        // same timestamp, larger id: forward
        assert!(state.advance(&event(2, 10)));
        // older: ignored
        assert!(!state.advance(&event(9, 5)));
        // same position: ignored
        assert!(!state.advance(&event(2, 10)));
        assert_eq!(state.cur_id, Some(node_id(2)));
    }

    #[tokio::test]
    async fn test_writer_flushes_per_buffer() {
        let dest = Arc::new(MemoryDestination::new(Uuid::nil()));
        let state = HarvestState::new("job", "src");
        let mut writer = CheckpointWriter::new(dest.clone(), state, 2);

        writer.record(&event(1, 1)).await.unwrap();
        assert_eq!(dest.state_writes(), 0);
        assert_eq!(writer.pending(), 1);

        writer.record(&event(2, 2)).await.unwrap();
        assert_eq!(dest.state_writes(), 1);
        assert_eq!(writer.pending(), 0);

        writer.record(&event(3, 3)).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(dest.state_writes(), 2);

        let stored = dest.harvest_state("job", "src").await.unwrap();
        assert_eq!(stored.cur_id, Some(node_id(3)));
        assert!(stored.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_flush_without_pending_is_noop() {
        let dest = Arc::new(MemoryDestination::new(Uuid::nil()));
        let mut writer = CheckpointWriter::new(dest.clone(), HarvestState::new("job", "src"), 1);
        writer.flush().await.unwrap();
        assert_eq!(dest.state_writes(), 0);
    }
}
