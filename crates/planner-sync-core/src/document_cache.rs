use crate::address::{document_address, LogicalPath};
use crate::context::SyncContext;
use crate::store::{DocumentEvent, SetOptions};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What a consumer sees: the current value plus the two flags that drive
/// loading indicators and "saving..." badges.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    pub data: Value,
    pub loading: bool,
    pub locally_pending: bool,
}

/// A debounced write waiting for its timer, owned by the path it was made on.
struct PendingWrite {
    generation: u64,
    timer: JoinHandle<()>,
}

struct State {
    path: LogicalPath,
    default_value: Value,
    data: Value,
    loading: bool,
    /// Write-pending lock per path: while the current path has an entry,
    /// subscription events are dropped so the optimistic value is never
    /// clobbered by a stale echo.
    pending: HashMap<LogicalPath, PendingWrite>,
    /// Bumped on every `write`; a flush only releases its path's lock if no
    /// newer write to that path was queued behind it.
    write_generation: u64,
    /// Bumped on every (re)subscription; events from older subscriptions are
    /// discarded.
    subscription_epoch: u64,
    listener: Option<JoinHandle<()>>,
}

impl State {
    fn suppresses_events(&self) -> bool {
        self.pending.contains_key(&self.path)
    }

    fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            data: self.data.clone(),
            loading: self.loading,
            locally_pending: self.suppresses_events(),
        }
    }
}

struct Shared {
    ctx: SyncContext,
    state: Mutex<State>,
    updates: watch::Sender<DocumentSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &State) {
        self.updates.send_replace(state.snapshot());
    }

    fn apply_event(&self, epoch: u64, event: DocumentEvent) {
        let mut state = self.lock();
        if state.subscription_epoch != epoch {
            return;
        }
        match event {
            Ok(_) if state.suppresses_events() => {
                tracing::debug!("Ignoring remote event for {} while a write is pending", state.path);
                return;
            }
            Ok(value) => {
                state.data = value.unwrap_or_else(|| state.default_value.clone());
                state.loading = false;
            }
            Err(e) => {
                tracing::warn!("Subscription to {} failed: {}", state.path, e);
                state.loading = false;
            }
        }
        self.publish(&state);
    }

    async fn flush(self: Arc<Self>, generation: u64, path: LogicalPath, value: Value) {
        if value.is_null() {
            tracing::debug!("Skipping flush of empty value for {}", path);
        } else {
            match &self.ctx.identity {
                Some(identity) => {
                    let address = document_address(identity, &path);
                    if let Err(e) = self.ctx.store.set(&address, value, SetOptions::merge()).await {
                        tracing::warn!("Failed to persist {} ({}): {}", path, address, e);
                    } else {
                        tracing::debug!("Persisted {} ({})", path, address);
                    }
                }
                None => self.ctx.local.set(&path.local_key(), value.to_string()),
            }
        }

        let mut state = self.lock();
        if state.pending.get(&path).map(|p| p.generation) == Some(generation) {
            state.pending.remove(&path);
            self.publish(&state);
        }
    }
}

async fn listen(shared: Arc<Shared>, epoch: u64, mut rx: mpsc::UnboundedReceiver<DocumentEvent>) {
    while let Some(event) = rx.recv().await {
        shared.apply_event(epoch, event);
    }
}

/// Live, optimistic view of one logical document.
///
/// Reads come from a remote subscription (or the local fallback store when
/// no identity is signed in). Writes update the value immediately and are
/// flushed after the debounce window; only the latest value in a burst is
/// ever sent.
///
/// Must be created inside a Tokio runtime.
pub struct DocumentCache {
    shared: Arc<Shared>,
}

impl DocumentCache {
    pub fn open(ctx: SyncContext, path: LogicalPath, default_value: Value) -> Self {
        let initial = DocumentSnapshot {
            data: default_value.clone(),
            loading: ctx.identity.is_some(),
            locally_pending: false,
        };
        let (updates, _) = watch::channel(initial);
        let cache = Self {
            shared: Arc::new(Shared {
                ctx,
                state: Mutex::new(State {
                    path,
                    data: default_value.clone(),
                    default_value,
                    loading: true,
                    pending: HashMap::new(),
                    write_generation: 0,
                    subscription_epoch: 0,
                    listener: None,
                }),
                updates,
            }),
        };
        cache.attach();
        cache
    }

    /// Point the cache at a different document. The previously displayed
    /// value stays visible (with `loading = true`) until the new path's
    /// first event arrives. A write already queued for the old path still
    /// flushes to the old path.
    pub fn set_path(&self, path: LogicalPath, default_value: Value) {
        {
            let mut state = self.shared.lock();
            if state.path == path {
                return;
            }
            tracing::debug!("Switching document cache from {} to {}", state.path, path);
            state.path = path;
            state.default_value = default_value;
        }
        self.attach();
    }

    /// Optimistically replace the value and (re)arm the current path's
    /// debounce timer. Writes still queued for other paths are left alone.
    pub fn write(&self, value: Value) {
        let shared = Arc::clone(&self.shared);
        let mut state = self.shared.lock();
        state.data = value.clone();
        state.write_generation += 1;

        let generation = state.write_generation;
        let path = state.path.clone();
        let delay = self.shared.ctx.debounce;
        let flush_path = path.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The flush runs on its own task so a later `write` can only
            // cancel a timer that has not fired yet, never an in-flight write.
            tokio::spawn(shared.flush(generation, flush_path, value));
        });
        if let Some(previous) = state.pending.insert(path, PendingWrite { generation, timer }) {
            previous.timer.abort();
        }
        self.shared.publish(&state);
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn value(&self) -> Value {
        self.shared.lock().data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.lock().loading
    }

    pub fn path(&self) -> LogicalPath {
        self.shared.lock().path.clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn watch(&self) -> watch::Receiver<DocumentSnapshot> {
        self.shared.updates.subscribe()
    }

    /// Cancel the subscription. A queued write is not cancelled.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.subscription_epoch += 1;
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
    }

    fn attach(&self) {
        let mut state = self.shared.lock();
        state.subscription_epoch += 1;
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }

        match &self.shared.ctx.identity {
            None => {
                let stored = self
                    .shared
                    .ctx
                    .local
                    .get(&state.path.local_key())
                    .and_then(|raw| match serde_json::from_str::<Value>(&raw) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            tracing::warn!("Ignoring unreadable local value for {}: {}", state.path, e);
                            None
                        }
                    });
                state.data = stored.unwrap_or_else(|| state.default_value.clone());
                state.loading = false;
            }
            Some(identity) => {
                let address = document_address(identity, &state.path);
                tracing::debug!("Subscribing to {} ({})", state.path, address);
                let rx = self.shared.ctx.store.subscribe_document(&address);
                state.loading = true;
                state.listener = Some(tokio::spawn(listen(
                    Arc::clone(&self.shared),
                    state.subscription_epoch,
                    rx,
                )));
            }
        }
        self.shared.publish(&state);
    }
}

impl Drop for DocumentCache {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::resolve_document;
    use crate::identity::Identity;
    use crate::local_store::{LocalStore, MemoryLocalStore};
    use crate::memory_store::MemoryStore;
    use crate::store::RemoteStore;
    use serde_json::json;
    use tokio::time::Duration;

    const DEBOUNCE: Duration = Duration::from_millis(900);

    fn path(raw: &str) -> LogicalPath {
        LogicalPath::parse(raw).unwrap()
    }

    fn signed_in(store: &Arc<MemoryStore>) -> SyncContext {
        SyncContext::new(
            store.clone(),
            Arc::new(MemoryLocalStore::new()),
            Some(Identity::new("u1")),
        )
        .with_debounce(DEBOUNCE)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    async fn seed(store: &MemoryStore, raw: &str, value: Value) {
        let address = resolve_document(&Identity::new("u1"), raw).unwrap();
        store.set(&address, value, SetOptions::merge()).await.unwrap();
    }

    // === subscription ===

    #[tokio::test(start_paused = true)]
    async fn loads_remote_value() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "planner/daily/2025-01-01", json!({"content": "hello"})).await;

        let cache = DocumentCache::open(signed_in(&store), path("planner/daily/2025-01-01"), json!({}));
        assert!(cache.is_loading());
        settle().await;
        assert!(!cache.is_loading());
        assert_eq!(cache.value(), json!({"content": "hello"}));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_document_yields_default() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("config/settings"), json!({"theme": "light"}));
        settle().await;
        assert_eq!(cache.snapshot().data, json!({"theme": "light"}));
        assert!(!cache.snapshot().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn path_switch_keeps_previous_value_until_first_event() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "planner/daily/a", json!({"content": "Data 1"})).await;
        seed(&store, "planner/daily/b", json!({"content": "Data 2"})).await;

        let cache = DocumentCache::open(signed_in(&store), path("planner/daily/a"), json!({"content": ""}));
        settle().await;
        assert_eq!(cache.value(), json!({"content": "Data 1"}));

        cache.set_path(path("planner/daily/b"), json!({"content": "default"}));
        let snapshot = cache.snapshot();
        assert!(snapshot.loading);
        assert_eq!(snapshot.data, json!({"content": "Data 1"}));

        settle().await;
        let snapshot = cache.snapshot();
        assert!(!snapshot.loading);
        assert_eq!(snapshot.data, json!({"content": "Data 2"}));
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_old_path_are_ignored_after_switch() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("planner/daily/a"), json!({}));
        settle().await;
        cache.set_path(path("planner/daily/b"), json!({}));
        settle().await;

        seed(&store, "planner/daily/a", json!({"content": "late"})).await;
        settle().await;
        assert_eq!(cache.value(), json!({}));
    }

    // === debounced writes ===

    #[tokio::test(start_paused = true)]
    async fn burst_of_writes_flushes_once_with_last_value() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("planner/daily/2025-01-01"), json!({}));
        settle().await;

        for i in 0..5 {
            cache.write(json!({"content": format!("draft {i}")}));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(store.write_count(), 0, "nothing flushes inside the window");
        assert_eq!(cache.value(), json!({"content": "draft 4"}));

        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;
        settle().await;

        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value, Some(json!({"content": "draft 4"})));
    }

    #[tokio::test(start_paused = true)]
    async fn write_is_visible_immediately_and_marks_pending() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("config/settings"), json!({}));
        settle().await;

        cache.write(json!({"theme": "dark"}));
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.data, json!({"theme": "dark"}));
        assert!(snapshot.locally_pending);

        tokio::time::sleep(DEBOUNCE * 2).await;
        settle().await;
        assert!(!cache.snapshot().locally_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_events_are_dropped_while_write_pending() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("config/settings"), json!({}));
        settle().await;

        cache.write(json!({"theme": "dark"}));
        seed(&store, "config/settings", json!({"theme": "stale"})).await;
        settle().await;
        assert_eq!(cache.value(), json!({"theme": "dark"}));

        tokio::time::sleep(DEBOUNCE * 2).await;
        settle().await;
        // The flush merged over the concurrent value and its echo was applied.
        assert_eq!(cache.value(), json!({"theme": "dark"}));
        let address = resolve_document(&Identity::new("u1"), "config/settings").unwrap();
        assert_eq!(store.peek(&address), Some(json!({"theme": "dark"})));
    }

    #[tokio::test(start_paused = true)]
    async fn null_write_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("config/settings"), json!({}));
        settle().await;

        cache.write(Value::Null);
        tokio::time::sleep(DEBOUNCE * 2).await;
        settle().await;
        assert_eq!(store.write_count(), 0);
        assert!(!cache.snapshot().locally_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_keeps_optimistic_value_and_releases_lock() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("config/settings"), json!({}));
        settle().await;

        store.fail_writes(true);
        cache.write(json!({"theme": "dark"}));
        tokio::time::sleep(DEBOUNCE * 2).await;
        settle().await;

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.data, json!({"theme": "dark"}));
        assert!(!snapshot.locally_pending);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_write_survives_close() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("config/settings"), json!({}));
        settle().await;
        cache.write(json!({"theme": "dark"}));
        drop(cache);

        tokio::time::sleep(DEBOUNCE * 2).await;
        settle().await;
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_write_targets_the_path_it_was_made_on() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("planner/daily/a"), json!({}));
        settle().await;
        cache.write(json!({"content": "for a"}));
        cache.set_path(path("planner/daily/b"), json!({}));

        tokio::time::sleep(DEBOUNCE * 2).await;
        settle().await;
        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].address, "users/u1/planner_daily/a");
        assert!(!cache.snapshot().locally_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn write_after_path_switch_keeps_the_earlier_write() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("planner/daily/a"), json!({}));
        settle().await;
        cache.write(json!({"content": "for a"}));
        cache.set_path(path("planner/daily/b"), json!({}));
        settle().await;
        cache.write(json!({"content": "for b"}));
        assert!(cache.snapshot().locally_pending);

        tokio::time::sleep(DEBOUNCE * 2).await;
        settle().await;
        let mut writes: Vec<(String, Option<Value>)> = store
            .writes()
            .into_iter()
            .map(|w| (w.address, w.value))
            .collect();
        writes.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            writes,
            vec![
                ("users/u1/planner_daily/a".to_string(), Some(json!({"content": "for a"}))),
                ("users/u1/planner_daily/b".to_string(), Some(json!({"content": "for b"}))),
            ]
        );
        assert!(!cache.snapshot().locally_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_path_flush_does_not_release_the_current_lock() {
        let store = Arc::new(MemoryStore::new());
        let cache = DocumentCache::open(signed_in(&store), path("planner/daily/a"), json!({}));
        settle().await;
        cache.write(json!({"content": "for a"}));
        tokio::time::sleep(DEBOUNCE / 2).await;
        cache.set_path(path("planner/daily/b"), json!({}));
        settle().await;
        cache.write(json!({"content": "for b"}));

        // a's timer fires first; b is still inside its window.
        tokio::time::sleep(DEBOUNCE * 3 / 4).await;
        settle().await;
        assert_eq!(store.write_count(), 1);
        assert!(cache.snapshot().locally_pending);
    }

    // === local fallback ===

    #[tokio::test(start_paused = true)]
    async fn anonymous_cache_reads_local_store_synchronously() {
        let local = Arc::new(MemoryLocalStore::new());
        local.set("planner-sync:config/settings", "{\"theme\":\"dark\"}".to_string());
        let ctx = SyncContext::new(Arc::new(MemoryStore::new()), local, None);

        let cache = DocumentCache::open(ctx, path("config/settings"), json!({}));
        let snapshot = cache.snapshot();
        assert!(!snapshot.loading);
        assert_eq!(snapshot.data, json!({"theme": "dark"}));
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_write_lands_in_local_store_after_debounce() {
        let store = Arc::new(MemoryStore::new());
        let local = Arc::new(MemoryLocalStore::new());
        let ctx = SyncContext::new(store.clone(), local.clone(), None).with_debounce(DEBOUNCE);

        let cache = DocumentCache::open(ctx, path("config/settings"), json!({}));
        cache.write(json!({"theme": "dark"}));
        assert!(local.get("planner-sync:config/settings").is_none());

        tokio::time::sleep(DEBOUNCE * 2).await;
        settle().await;
        assert_eq!(
            local.get("planner-sync:config/settings").as_deref(),
            Some("{\"theme\":\"dark\"}")
        );
        assert_eq!(store.write_count(), 0);
    }
}
