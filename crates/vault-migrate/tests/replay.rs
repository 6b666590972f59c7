//! Deletion replay across interrupted runs.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vault_migrate::core::{node_id, DeletedNodeEvent, DestinationStore, NodeType};
use vault_migrate::memory::{MemoryDestination, MemorySource};
use vault_migrate::{DeletionReplayer, HarvestState, MigrateError, ReplaySettings};

const K: i64 = 23;

/// K events, several of them sharing a timestamp.
fn deletion_log() -> Arc<MemorySource> {
    let mut src = MemorySource::new("vos://cadc.nrc.ca!vault");
    for row in 1..=K {
        src.add_deleted(DeletedNodeEvent {
            id: node_id(row),
            node_type: if row % 3 == 0 {
                NodeType::Container
            } else {
                NodeType::Data
            },
            last_modified: Utc.timestamp_opt(1_600_000_000 + row / 2, 0).unwrap(),
        });
    }
    Arc::new(src)
}

fn settings(checkpoint_buffer: usize) -> ReplaySettings {
    ReplaySettings {
        batch_size: 5,
        checkpoint_buffer,
        ..Default::default()
    }
}

async fn interrupted_then_resumed(j: usize, checkpoint_buffer: usize) {
    let log = deletion_log();
    let dest = Arc::new(MemoryDestination::new(Uuid::nil()).fail_deletes_after(j));
    let replayer = DeletionReplayer::new(log, dest.clone(), settings(checkpoint_buffer));

    let err = replayer.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MigrateError::Replay(_)), "j={}", j);
    assert_eq!(dest.deleted().len(), j);

    dest.clear_failures();
    let resumed = replayer.run(CancellationToken::new()).await.unwrap();

    assert_eq!(resumed.status, "completed");
    assert_eq!(resumed.events_applied as usize, K as usize - j, "j={}", j);
    let deleted = dest.deleted();
    let distinct: HashSet<_> = deleted.iter().collect();
    assert_eq!(deleted.len(), K as usize, "j={}", j);
    assert_eq!(distinct.len(), K as usize, "j={}", j);
    assert_eq!(resumed.cursor_id, Some(node_id(K)));
}

#[tokio::test]
async fn resumes_exactly_where_it_stopped() {
    for j in [0, 1, 4, 5, 6, 11, 22] {
        interrupted_then_resumed(j, 1).await;
    }
}

#[tokio::test]
async fn buffered_checkpoint_still_resumes_exactly() {
    for j in [1, 7, 13] {
        interrupted_then_resumed(j, 4).await;
    }
}

#[tokio::test]
async fn checkpoint_is_stored_under_the_job_name() {
    let log = deletion_log();
    let dest = Arc::new(MemoryDestination::new(Uuid::nil()));
    let settings = ReplaySettings {
        job_name: "nightly-deletions".into(),
        ..settings(1)
    };
    DeletionReplayer::new(log, dest.clone(), settings)
        .run(CancellationToken::new())
        .await
        .unwrap();

    let state = dest
        .harvest_state("nightly-deletions", "unused")
        .await
        .unwrap();
    assert_eq!(state.cur_id, Some(node_id(K)));
    assert_eq!(state.source, "db:mssql:vospace");
    let untouched = dest.harvest_state("migrate-deletions", "x").await.unwrap();
    assert!(untouched.cursor().is_none());
}

#[tokio::test]
async fn seeded_checkpoint_skips_earlier_events() {
    let log = deletion_log();
    let mut seed = HarvestState::new("migrate-deletions", "db:mssql:vospace");
    seed.cur_last_modified = Some(Utc.timestamp_opt(1_600_000_000 + 10 / 2, 0).unwrap());
    seed.cur_id = Some(node_id(10));
    let dest = Arc::new(MemoryDestination::new(Uuid::nil()).with_harvest_state(seed));

    let result = DeletionReplayer::new(log, dest.clone(), settings(1))
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.events_applied, (K - 10) as u64);
    assert_eq!(dest.deleted().first(), Some(&node_id(11)));
}
