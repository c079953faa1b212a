use crate::address::LogicalPath;
use crate::collection_cache::CollectionCache;
use crate::context::SyncContext;
use crate::document_cache::DocumentCache;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Weak};

/// Hands out one shared cache instance per logical path.
///
/// The registry only holds weak references: when the last consumer drops
/// its `Arc`, the cache unsubscribes. A write it had queued still flushes.
pub struct CacheRegistry {
    ctx: SyncContext,
    /// logical path -> live document cache
    documents: DashMap<LogicalPath, Weak<DocumentCache>>,
    /// (logical path, order field) -> live collection cache
    collections: DashMap<(LogicalPath, Option<String>), Weak<CollectionCache>>,
}

impl CacheRegistry {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            documents: DashMap::new(),
            collections: DashMap::new(),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Existing cache for `path`, or a new one seeded with `default_value`.
    /// The default only matters for the consumer that creates the cache.
    pub fn document(&self, path: &LogicalPath, default_value: Value) -> Arc<DocumentCache> {
        let mut slot = self.documents.entry(path.clone()).or_default();
        if let Some(cache) = slot.upgrade() {
            return cache;
        }
        tracing::debug!("Opening document cache for {}", path);
        let cache = Arc::new(DocumentCache::open(self.ctx.clone(), path.clone(), default_value));
        *slot = Arc::downgrade(&cache);
        cache
    }

    pub fn collection(&self, path: &LogicalPath, order_by: Option<&str>) -> Arc<CollectionCache> {
        let key = (path.clone(), order_by.map(str::to_string));
        let mut slot = self.collections.entry(key).or_default();
        if let Some(cache) = slot.upgrade() {
            return cache;
        }
        tracing::debug!("Opening collection cache for {}", path);
        let cache = Arc::new(CollectionCache::open(self.ctx.clone(), path.clone(), order_by));
        *slot = Arc::downgrade(&cache);
        cache
    }

    /// Forget entries whose caches have no consumers left.
    pub fn prune(&self) {
        self.documents.retain(|_, cache| cache.strong_count() > 0);
        self.collections.retain(|_, cache| cache.strong_count() > 0);
    }

    /// Number of caches that currently have at least one consumer.
    pub fn live_count(&self) -> usize {
        let documents = self.documents.iter().filter(|e| e.strong_count() > 0).count();
        let collections = self.collections.iter().filter(|e| e.strong_count() > 0).count();
        documents + collections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::local_store::MemoryLocalStore;
    use crate::memory_store::MemoryStore;
    use serde_json::json;

    fn registry() -> (Arc<MemoryStore>, CacheRegistry) {
        let store = Arc::new(MemoryStore::new());
        let ctx = SyncContext::new(
            store.clone(),
            Arc::new(MemoryLocalStore::new()),
            Some(Identity::new("u1")),
        );
        (store, CacheRegistry::new(ctx))
    }

    fn path(raw: &str) -> LogicalPath {
        LogicalPath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn same_path_shares_one_cache() {
        let (_, registry) = registry();
        let a = registry.document(&path("config/settings"), json!({}));
        let b = registry.document(&path("/config/settings/"), json!({}));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn collections_are_keyed_by_order() {
        let (_, registry) = registry();
        let plain = registry.collection(&path("tasks"), None);
        let ordered = registry.collection(&path("tasks"), Some("createdAt"));
        assert!(!Arc::ptr_eq(&plain, &ordered));
        assert!(Arc::ptr_eq(&plain, &registry.collection(&path("tasks"), None)));
    }

    #[tokio::test]
    async fn dropping_last_handle_releases_cache() {
        let (_, registry) = registry();
        let first = registry.document(&path("config/settings"), json!({}));
        drop(first);
        assert_eq!(registry.live_count(), 0);
        registry.prune();
        assert!(registry.documents.is_empty());

        let reopened = registry.document(&path("config/settings"), json!({"fresh": true}));
        assert_eq!(reopened.value(), json!({"fresh": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn released_cache_still_flushes_queued_write() {
        let (store, registry) = registry();
        let cache = registry.document(&path("config/settings"), json!({}));
        cache.write(json!({"theme": "dark"}));
        drop(cache);

        tokio::time::sleep(crate::context::DEFAULT_DEBOUNCE * 2).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.write_count(), 1);
    }
}
