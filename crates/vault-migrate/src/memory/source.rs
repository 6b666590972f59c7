//! In-memory source store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::{
    ContainerRef, DeletedNodeEvent, DeletionLog, PropertyCache, SourceKind, SourceNode,
    SourceProperty, SourceStore,
};
use crate::error::{MigrateError, Result};

/// Source tree held in memory.
///
/// Built up front with the `add_*` methods, then shared behind an `Arc`.
/// Listing follows the legacy store's contract: children are ordered by
/// name and a page requested `after` a name includes that name again.
#[derive(Debug)]
pub struct MemorySource {
    root_path: String,
    nodes: HashMap<i64, SourceNode>,
    children: HashMap<Option<i64>, Vec<i64>>,
    properties: HashMap<i64, Vec<SourceProperty>>,
    deleted: Vec<DeletedNodeEvent>,
    page_queries: AtomicUsize,
    property_queries: AtomicUsize,
}

impl MemorySource {
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            nodes: HashMap::new(),
            children: HashMap::new(),
            properties: HashMap::new(),
            deleted: Vec::new(),
            page_queries: AtomicUsize::new(0),
            property_queries: AtomicUsize::new(0),
        }
    }

    /// Add a node of any kind below `parent` (`None` = root).
    ///
    /// The parent must already have been added.
    pub fn add_node(
        &mut self,
        parent: Option<i64>,
        row_id: i64,
        name: &str,
        kind: SourceKind,
    ) -> Result<&mut Self> {
        let path = match parent {
            None => ContainerRef::root(self.root_path.clone()).child_path(name),
            Some(pid) => {
                let p = self.nodes.get(&pid).ok_or_else(|| {
                    MigrateError::Store(format!("parent {} of {} not present", pid, name))
                })?;
                p.as_container().child_path(name)
            }
        };
        let node = SourceNode {
            row_id,
            parent_row_id: parent,
            name: name.to_string(),
            path,
            owner: Some(format!("owner-{}", row_id)),
            is_public: false,
            is_locked: false,
            kind,
            properties: Vec::new(),
        };
        self.nodes.insert(row_id, node);

        let siblings = self.children.entry(parent).or_default();
        siblings.push(row_id);
        let nodes = &self.nodes;
        siblings.sort_by(|a, b| nodes[a].name.cmp(&nodes[b].name));
        Ok(self)
    }

    pub fn add_container(&mut self, parent: Option<i64>, row_id: i64, name: &str) -> Result<&mut Self> {
        self.add_node(parent, row_id, name, SourceKind::Container)
    }

    pub fn add_data(&mut self, parent: Option<i64>, row_id: i64, name: &str) -> Result<&mut Self> {
        self.add_node(
            parent,
            row_id,
            name,
            SourceKind::Data {
                storage_id: format!("{:016x}", row_id),
                content_length: Some(1024),
            },
        )
    }

    pub fn add_link(
        &mut self,
        parent: Option<i64>,
        row_id: i64,
        name: &str,
        target: &str,
    ) -> Result<&mut Self> {
        self.add_node(
            parent,
            row_id,
            name,
            SourceKind::Link {
                target: target.to_string(),
            },
        )
    }

    /// Attach a custom property (as stored in the property table).
    pub fn add_property(&mut self, row_id: i64, key: &str, value: &str) -> &mut Self {
        self.properties
            .entry(row_id)
            .or_default()
            .push(SourceProperty::new(key, value));
        self
    }

    /// Append a deletion event to the log.
    pub fn add_deleted(&mut self, event: DeletedNodeEvent) -> &mut Self {
        self.deleted.push(event);
        self.deleted.sort_by_key(|e| e.position());
        self
    }

    /// Number of `children_page` calls served.
    pub fn page_queries(&self) -> usize {
        self.page_queries.load(Ordering::Relaxed)
    }

    /// Number of per-node `properties` calls served.
    pub fn property_queries(&self) -> usize {
        self.property_queries.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn root(&self) -> Result<ContainerRef> {
        Ok(ContainerRef::root(self.root_path.clone()))
    }

    async fn children_page(
        &self,
        container: &ContainerRef,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SourceNode>> {
        self.page_queries.fetch_add(1, Ordering::Relaxed);
        let Some(ids) = self.children.get(&container.row_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .map(|id| &self.nodes[id])
            .filter(|n| after.map_or(true, |a| n.name.as_str() >= a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn child(&self, container: &ContainerRef, name: &str) -> Result<Option<SourceNode>> {
        Ok(self.children.get(&container.row_id).and_then(|ids| {
            ids.iter()
                .map(|id| &self.nodes[id])
                .find(|n| n.name == name)
                .cloned()
        }))
    }

    async fn properties(&self, node: &SourceNode) -> Result<Vec<SourceProperty>> {
        self.property_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.properties.get(&node.row_id).cloned().unwrap_or_default())
    }

    async fn property_cache(&self) -> Result<PropertyCache> {
        Ok(self.properties.clone())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl DeletionLog for MemorySource {
    async fn deleted_events(
        &self,
        min_timestamp: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<DeletedNodeEvent>> {
        Ok(self
            .deleted
            .iter()
            .filter(|e| min_timestamp.map_or(true, |min| e.last_modified >= min))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_children_page_is_inclusive_of_after() {
        let mut src = MemorySource::new("vos://test!vault");
        src.add_container(None, 1, "a").unwrap();
        src.add_data(None, 2, "b").unwrap();
        src.add_data(None, 3, "c").unwrap();

        let root = src.root().await.unwrap();
        let page = src.children_page(&root, Some("b"), 10).await.unwrap();
        let names: Vec<_> = page.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(src.page_queries(), 1);
    }

    #[tokio::test]
    async fn test_paths_follow_parents() {
        let mut src = MemorySource::new("vos://test!vault");
        src.add_container(None, 1, "home").unwrap();
        src.add_data(Some(1), 2, "file.txt").unwrap();

        let root = src.root().await.unwrap();
        let home = src.child(&root, "home").await.unwrap().unwrap();
        let file = src
            .child(&home.as_container(), "file.txt")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.path, "vos://test!vault/home/file.txt");
        assert_eq!(file.parent_row_id, Some(1));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let mut src = MemorySource::new("vos://test!vault");
        assert!(src.add_data(Some(99), 1, "x").is_err());
    }
}
