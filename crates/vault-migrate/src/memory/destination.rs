//! In-memory destination store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::lock;
use crate::core::{DestinationStore, Node};
use crate::error::{MigrateError, Result};
use crate::state::HarvestState;

/// Destination store held in memory.
///
/// Records the order of writes and deletes so tests can check traversal
/// ordering and replay progress.
#[derive(Debug)]
pub struct MemoryDestination {
    root_id: Uuid,
    require_parent: bool,
    fail_deletes_after: Mutex<Option<usize>>,
    nodes: Mutex<HashMap<Uuid, Node>>,
    write_order: Mutex<Vec<Uuid>>,
    deleted: Mutex<Vec<Uuid>>,
    states: Mutex<HashMap<String, HarvestState>>,
    state_writes: AtomicUsize,
}

impl MemoryDestination {
    pub fn new(root_id: Uuid) -> Self {
        Self {
            root_id,
            require_parent: false,
            fail_deletes_after: Mutex::new(None),
            nodes: Mutex::new(HashMap::new()),
            write_order: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            state_writes: AtomicUsize::new(0),
        }
    }

    /// Reject a `put` whose parent has not been written yet.
    pub fn require_parent(mut self, on: bool) -> Self {
        self.require_parent = on;
        self
    }

    /// Fail every delete once `n` deletes have succeeded.
    pub fn fail_deletes_after(self, n: usize) -> Self {
        if let Ok(mut limit) = self.fail_deletes_after.lock() {
            *limit = Some(n);
        }
        self
    }

    /// Stop injecting delete failures.
    pub fn clear_failures(&self) {
        if let Ok(mut limit) = self.fail_deletes_after.lock() {
            *limit = None;
        }
    }

    /// Seed a checkpoint, as if stored by an earlier run.
    pub fn with_harvest_state(self, state: HarvestState) -> Self {
        if let Ok(mut states) = self.states.lock() {
            states.insert(state.name.clone(), state);
        }
        self
    }

    pub fn get(&self, id: &Uuid) -> Option<Node> {
        lock(&self.nodes).ok().and_then(|n| n.get(id).cloned())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        lock(&self.nodes).map(|n| n.contains_key(id)).unwrap_or(false)
    }

    /// Number of nodes currently stored.
    pub fn len(&self) -> usize {
        lock(&self.nodes).map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in the order they were written (repeats included).
    pub fn write_order(&self) -> Vec<Uuid> {
        lock(&self.write_order).map(|w| w.clone()).unwrap_or_default()
    }

    /// Number of `put` calls served.
    pub fn put_count(&self) -> usize {
        lock(&self.write_order).map(|w| w.len()).unwrap_or(0)
    }

    /// Ids in the order they were deleted (repeats included).
    pub fn deleted(&self) -> Vec<Uuid> {
        lock(&self.deleted).map(|d| d.clone()).unwrap_or_default()
    }

    /// Number of checkpoint writes.
    pub fn state_writes(&self) -> usize {
        self.state_writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    async fn put(&self, node: &Node) -> Result<()> {
        let mut nodes = lock(&self.nodes)?;
        if self.require_parent
            && node.parent_id != self.root_id
            && !nodes.contains_key(&node.parent_id)
        {
            return Err(MigrateError::Store(format!(
                "parent {} of {} ({}) not written yet",
                node.parent_id, node.name, node.id
            )));
        }
        nodes.insert(node.id, node.clone());
        lock(&self.write_order)?.push(node.id);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut deleted = lock(&self.deleted)?;
        if let Some(limit) = *lock(&self.fail_deletes_after)? {
            if deleted.len() >= limit {
                return Err(MigrateError::Store(format!(
                    "injected delete failure for {}",
                    id
                )));
            }
        }
        lock(&self.nodes)?.remove(&id);
        deleted.push(id);
        Ok(())
    }

    fn root_id(&self) -> Uuid {
        self.root_id
    }

    async fn harvest_state(&self, name: &str, source: &str) -> Result<HarvestState> {
        Ok(lock(&self.states)?
            .get(name)
            .cloned()
            .unwrap_or_else(|| HarvestState::new(name, source)))
    }

    async fn put_harvest_state(&self, state: &HarvestState) -> Result<()> {
        lock(&self.states)?.insert(state.name.clone(), state.clone());
        self.state_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
