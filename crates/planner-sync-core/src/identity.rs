use serde::{Deserialize, Serialize};

/// The signed-in account. Absence (`None` wherever an `Option<Identity>` is
/// taken) routes caches to the local fallback store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Require a session for operations that refuse to run anonymously.
pub fn require(identity: Option<&Identity>) -> crate::error::Result<&Identity> {
    identity.ok_or(crate::error::SyncError::NotAuthenticated)
}
