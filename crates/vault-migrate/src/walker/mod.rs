//! Non-recursive, paginated traversal of a source container.
//!
//! The source store only lists direct children, one bounded page at a time.
//! [`TreeIterator`] builds a depth-first walk on top of that with an explicit
//! stack of containers waiting to be expanded, so memory use is one page plus
//! the stack and traversal depth never touches the call stack.
//!
//! Containers are pushed on the stack as they are handed out, so a container's
//! children are listed only after all of its siblings have been yielded. Every
//! node is still yielded after its parent, which is all a writer needs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::{ContainerRef, PropertyCache, SourceNode, SourceStore};
use crate::error::Result;

/// Counters kept while walking.
#[derive(Debug, Clone, Default)]
pub struct IteratorStats {
    /// Time spent in listing and property queries.
    pub query_time: Duration,

    /// Number of listing queries issued.
    pub page_queries: usize,

    /// Nodes handed out.
    pub yielded: usize,

    /// Largest size the pending-container stack reached.
    pub max_pending: usize,
}

/// Lazy, finite, single-pass iterator over the descendants of a container.
pub struct TreeIterator {
    source: Arc<dyn SourceStore>,
    property_cache: Option<Arc<PropertyCache>>,
    page_size: usize,
    descend: bool,

    /// Container whose children are currently being paged.
    current: Option<ContainerRef>,
    batch: VecDeque<SourceNode>,
    pending: Vec<ContainerRef>,
    last_name: Option<String>,
    last_page_short: bool,

    stats: IteratorStats,
}

impl TreeIterator {
    /// Walk every descendant of `container`.
    ///
    /// `page_size` is raised to 2 if smaller: the first row of each follow-up
    /// page repeats the previous page's last row, so a page of one would never
    /// make progress.
    pub fn new(source: Arc<dyn SourceStore>, container: ContainerRef, page_size: usize) -> Self {
        Self {
            source,
            property_cache: None,
            page_size: page_size.max(2),
            descend: true,
            current: Some(container),
            batch: VecDeque::new(),
            pending: Vec::new(),
            last_name: None,
            last_page_short: false,
            stats: IteratorStats::default(),
        }
    }

    /// Only yield the direct children of the starting container.
    pub fn shallow(mut self) -> Self {
        self.descend = false;
        self
    }

    /// Take node properties from a prefetched cache instead of querying per node.
    pub fn with_property_cache(mut self, cache: Arc<PropertyCache>) -> Self {
        self.property_cache = Some(cache);
        self
    }

    pub fn stats(&self) -> &IteratorStats {
        &self.stats
    }

    pub fn into_stats(self) -> IteratorStats {
        self.stats
    }

    /// Next node in walk order, with its properties attached.
    ///
    /// Returns `Ok(None)` once the walk is finished, and keeps doing so.
    pub async fn next(&mut self) -> Result<Option<SourceNode>> {
        loop {
            if let Some(mut node) = self.batch.pop_front() {
                if self.descend && node.is_container() {
                    self.pending.push(node.as_container());
                    self.stats.max_pending = self.stats.max_pending.max(self.pending.len());
                }
                self.attach_properties(&mut node).await?;
                self.stats.yielded += 1;
                return Ok(Some(node));
            }

            if self.current.is_some() && !self.last_page_short {
                self.fetch_page().await?;
                continue;
            }

            match self.pending.pop() {
                Some(next) => {
                    debug!("expanding {} ({} pending)", next.path, self.pending.len());
                    self.current = Some(next);
                    self.last_name = None;
                    self.last_page_short = false;
                }
                None => {
                    self.current = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let Some(container) = self.current.as_ref() else {
            return Ok(());
        };

        let start = Instant::now();
        let page = self
            .source
            .children_page(container, self.last_name.as_deref(), self.page_size)
            .await?;
        self.stats.query_time += start.elapsed();
        self.stats.page_queries += 1;

        let fetched = page.len();
        self.last_page_short = fetched < self.page_size;

        let mut page = VecDeque::from(page);
        if let Some(last) = page.back() {
            let next_after = last.name.clone();
            if self.last_name.as_deref() == page.front().map(|n| n.name.as_str()) {
                page.pop_front();
            }
            self.last_name = Some(next_after);
        }

        debug!(
            "page of {} under {} (fetched {}, short: {})",
            page.len(),
            container.path,
            fetched,
            self.last_page_short
        );
        self.batch = page;
        Ok(())
    }

    async fn attach_properties(&mut self, node: &mut SourceNode) -> Result<()> {
        match &self.property_cache {
            Some(cache) => {
                if let Some(props) = cache.get(&node.row_id) {
                    node.properties.extend(props.iter().cloned());
                }
            }
            None => {
                let start = Instant::now();
                let props = self.source.properties(node).await?;
                self.stats.query_time += start.elapsed();
                node.properties.extend(props);
            }
        }
        Ok(())
    }
}
