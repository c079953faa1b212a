use crate::identity::Identity;
use crate::local_store::LocalStore;
use crate::store::RemoteStore;
use std::sync::Arc;
use std::time::Duration;

/// Delay between the last local write to a document and its remote flush.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(900);

/// Everything a cache needs to reach storage: the remote store, the local
/// fallback, and the current identity (if any).
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn RemoteStore>,
    pub local: Arc<dyn LocalStore>,
    pub identity: Option<Identity>,
    pub debounce: Duration,
}

impl SyncContext {
    pub fn new(store: Arc<dyn RemoteStore>, local: Arc<dyn LocalStore>, identity: Option<Identity>) -> Self {
        Self {
            store,
            local,
            identity,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}
