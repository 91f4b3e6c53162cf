//! Search index hooks.
//!
//! The indexer itself lives outside the kernel. Mutations and fresh listings
//! report what they saw through the [`SearchSlot`]; indexing failures are
//! logged and never fail the operation that triggered them.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::context::OpContext;
use crate::error::StorageResult;
use crate::types::Object;

/// One indexed entry: an object name under a virtual parent directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchNode {
    pub parent: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

impl SearchNode {
    pub fn new(parent: impl Into<String>, obj: &Object) -> Self {
        Self {
            parent: parent.into(),
            name: obj.name.clone(),
            is_dir: obj.is_dir,
            size: obj.size,
        }
    }
}

/// An out-of-core search index.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Index one object.
    async fn index(&self, cx: &OpContext, node: SearchNode) -> StorageResult<()>;

    /// Index many objects at once.
    async fn batch_index(&self, cx: &OpContext, nodes: Vec<SearchNode>) -> StorageResult<()>;

    /// Release resources held by the index. Called when it is replaced.
    async fn release(&self) -> StorageResult<()>;
}

/// The process-wide "current indexer".
///
/// Empty until [`init`](Self::init). Replacing the indexer releases the
/// previous one first.
#[derive(Default)]
pub struct SearchSlot {
    current: RwLock<Option<Arc<dyn Indexer>>>,
    auto_update: AtomicBool,
}

impl SearchSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an indexer, releasing whichever was installed before.
    pub async fn init(&self, indexer: Arc<dyn Indexer>) {
        let previous = self.current.write().replace(indexer);
        if let Some(previous) = previous {
            if let Err(e) = previous.release().await {
                warn!(error = %e, "failed to release previous search index");
            }
        }
        info!("search index installed");
    }

    /// Remove and release the current indexer.
    pub async fn reset(&self) {
        let previous = self.current.write().take();
        if let Some(previous) = previous {
            if let Err(e) = previous.release().await {
                warn!(error = %e, "failed to release search index");
            }
        }
    }

    /// Whether fresh listings are batch-indexed.
    pub fn set_auto_update(&self, on: bool) {
        self.auto_update.store(on, Ordering::Relaxed);
    }

    pub fn auto_update(&self) -> bool {
        self.auto_update.load(Ordering::Relaxed) && self.is_enabled()
    }

    pub fn is_enabled(&self) -> bool {
        self.current.read().is_some()
    }

    fn current(&self) -> Option<Arc<dyn Indexer>> {
        self.current.read().clone()
    }

    /// Index one object under `parent`. No-op when no indexer is installed.
    pub async fn index(&self, cx: &OpContext, parent: &str, obj: &Object) {
        let Some(indexer) = self.current() else {
            return;
        };
        if let Err(e) = indexer.index(cx, SearchNode::new(parent, obj)).await {
            warn!(parent, name = %obj.name, error = %e, "failed to index object");
        }
    }

    /// Index a whole listing of `parent`.
    pub async fn index_listing(&self, cx: &OpContext, parent: &str, objs: &[Object]) {
        let Some(indexer) = self.current() else {
            return;
        };
        if objs.is_empty() {
            return;
        }
        let nodes = objs.iter().map(|o| SearchNode::new(parent, o)).collect();
        match indexer.batch_index(cx, nodes).await {
            Ok(()) => debug!(parent, count = objs.len(), "listing indexed"),
            Err(e) => warn!(parent, error = %e, "failed to batch index listing"),
        }
    }
}

/// In-process index: a flat list of nodes searched by substring.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    nodes: RwLock<Vec<SearchNode>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes whose name contains `keyword`, case-insensitively.
    pub fn search(&self, keyword: &str) -> Vec<SearchNode> {
        let keyword = keyword.to_lowercase();
        self.nodes
            .read()
            .iter()
            .filter(|n| n.name.to_lowercase().contains(&keyword))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn upsert(nodes: &mut Vec<SearchNode>, node: SearchNode) {
        match nodes
            .iter_mut()
            .find(|n| n.parent == node.parent && n.name == node.name)
        {
            Some(existing) => *existing = node,
            None => nodes.push(node),
        }
    }
}

#[async_trait]
impl Indexer for MemoryIndex {
    async fn index(&self, cx: &OpContext, node: SearchNode) -> StorageResult<()> {
        cx.check()?;
        Self::upsert(&mut self.nodes.write(), node);
        Ok(())
    }

    async fn batch_index(&self, cx: &OpContext, nodes: Vec<SearchNode>) -> StorageResult<()> {
        cx.check()?;
        let mut all = self.nodes.write();
        for node in nodes {
            Self::upsert(&mut all, node);
        }
        Ok(())
    }

    async fn release(&self) -> StorageResult<()> {
        self.nodes.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slot_without_indexer_is_noop() {
        let slot = SearchSlot::new();
        slot.set_auto_update(true);
        assert!(!slot.auto_update());
        slot.index(&OpContext::background(), "/", &Object::file("a", 1))
            .await;
    }

    #[tokio::test]
    async fn test_index_and_search() {
        let slot = SearchSlot::new();
        let index = Arc::new(MemoryIndex::new());
        slot.init(index.clone()).await;

        let cx = OpContext::background();
        slot.index_listing(
            &cx,
            "/films",
            &[Object::file("Alien.mkv", 10), Object::dir("extras")],
        )
        .await;
        slot.index(&cx, "/films", &Object::file("Alien.mkv", 12)).await;

        assert_eq!(index.len(), 2);
        let hits = index.search("alien");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].size, 12);
    }

    #[tokio::test]
    async fn test_init_releases_previous() {
        let slot = SearchSlot::new();
        let first = Arc::new(MemoryIndex::new());
        slot.init(first.clone()).await;
        slot.index(&OpContext::background(), "/", &Object::file("x", 1))
            .await;
        assert_eq!(first.len(), 1);

        slot.init(Arc::new(MemoryIndex::new())).await;
        assert!(first.is_empty());

        slot.reset().await;
        assert!(!slot.is_enabled());
    }
}
