//! Store abstractions used by the migration engine.
//!
//! - [`SourceStore`]: read-only access to the legacy node tree
//! - [`DeletionLog`]: the legacy store's deletion event log
//! - [`DestinationStore`]: read/write access to the new node store
//!
//! The engine only ever holds `Arc<dyn ...>` handles, so the MSSQL/PostgreSQL
//! adapters and the in-memory stores are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::state::HarvestState;

use super::node::{ContainerRef, DeletedNodeEvent, Node, SourceNode, SourceProperty};

/// Properties for every node, keyed by source row id.
pub type PropertyCache = HashMap<i64, Vec<SourceProperty>>;

/// Read access to the source node tree.
///
/// The store only offers shallow listings; deep traversal is built on top
/// of [`children_page`](SourceStore::children_page) by the tree iterator.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Handle for the namespace root.
    async fn root(&self) -> Result<ContainerRef>;

    /// List up to `limit` children of `container`, ordered by name.
    ///
    /// When `after` is set, the page starts at that name *inclusive*; callers
    /// must skip a leading row equal to `after`.
    async fn children_page(
        &self,
        container: &ContainerRef,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SourceNode>>;

    /// Look up one direct child by name.
    async fn child(&self, container: &ContainerRef, name: &str) -> Result<Option<SourceNode>>;

    /// Custom properties of a single node.
    async fn properties(&self, node: &SourceNode) -> Result<Vec<SourceProperty>>;

    /// Prefetch every node's properties in one pass.
    async fn property_cache(&self) -> Result<PropertyCache>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;

    /// Store type for logging.
    fn store_type(&self) -> &'static str;
}

/// The source's append-only, timestamp-ordered deletion log.
#[async_trait]
pub trait DeletionLog: Send + Sync {
    /// Up to `limit` events with timestamp >= `min_timestamp` (all events when
    /// `None`), ordered by (timestamp, id).
    async fn deleted_events(
        &self,
        min_timestamp: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<DeletedNodeEvent>>;
}

/// Read/write access to the destination node store.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Insert or replace a node.
    async fn put(&self, node: &Node) -> Result<()>;

    /// Delete a node by id. Deleting an absent node is not an error.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Identifier of the destination root container.
    fn root_id(&self) -> Uuid;

    /// Read the named checkpoint, or a fresh one if none was stored yet.
    async fn harvest_state(&self, name: &str, source: &str) -> Result<HarvestState>;

    /// Persist a checkpoint.
    async fn put_harvest_state(&self, state: &HarvestState) -> Result<()>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;

    /// Store type for logging.
    fn store_type(&self) -> &'static str;
}
