use crate::error::{Result, SyncError};
use crate::identity::Identity;
use std::fmt;

/// Root container every identity-scoped address lives under.
pub const USERS_ROOT: &str = "users";

/// Separator used when several logical segments collapse into one container.
const MERGE_SEPARATOR: &str = "_";

/// Prefix applied to logical paths when they are used as local fallback keys.
const LOCAL_KEY_PREFIX: &str = "planner-sync:";

// ---------------------------------------------------------------------------
// Logical paths
// ---------------------------------------------------------------------------

/// Application-level `/`-delimited identifier, independent of storage rules.
///
/// Empty segments are dropped, so `"/planner//daily/"` and `"planner/daily"`
/// are the same path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalPath {
    segments: Vec<String>,
}

impl LogicalPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let segments: Vec<String> = raw
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if segments.is_empty() {
            return Err(SyncError::InvalidPath(raw.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Append one segment, e.g. a document id under a collection path.
    pub fn child(&self, segment: &str) -> Result<Self> {
        let segment = segment.trim();
        if segment.is_empty() || segment.contains('/') {
            return Err(SyncError::InvalidPath(format!("{}/{}", self, segment)));
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// Deterministic key for the local fallback store.
    pub fn local_key(&self) -> String {
        format!("{}{}", LOCAL_KEY_PREFIX, self)
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl std::str::FromStr for LogicalPath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Physical addresses
// ---------------------------------------------------------------------------

/// Physical document address: alternating container/item segments, always an
/// even count.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentAddress {
    segments: Vec<String>,
}

/// Physical collection address: alternating container/item segments ending
/// on a container, always an odd count.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionAddress {
    segments: Vec<String>,
}

impl DocumentAddress {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Final segment: the document id within its collection.
    pub fn id(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// The collection this document is an item of.
    pub fn parent(&self) -> CollectionAddress {
        CollectionAddress {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }
}

impl CollectionAddress {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Address of the document `id` inside this collection.
    pub fn document(&self, id: &str) -> Result<DocumentAddress> {
        let id = id.trim();
        if id.is_empty() || id.contains('/') {
            return Err(SyncError::InvalidPath(format!("{}/{}", self, id)));
        }
        let mut segments = self.segments.clone();
        segments.push(id.to_string());
        Ok(DocumentAddress { segments })
    }
}

impl fmt::Display for DocumentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl fmt::Display for CollectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

fn identity_prefix(identity: &Identity) -> Vec<String> {
    vec![USERS_ROOT.to_string(), identity.id.clone()]
}

/// Map a logical path to the physical address of a document.
///
/// The identity prefix contributes two segments, so the logical part must be
/// even. Odd logical paths collapse everything but the final segment into a
/// single container: `planner/weekly/2025-W01` → `planner_weekly/2025-W01`.
pub fn document_address(identity: &Identity, path: &LogicalPath) -> DocumentAddress {
    let mut segments = identity_prefix(identity);
    let logical = path.segments();
    match logical.split_last() {
        _ if logical.len() % 2 == 0 => segments.extend(logical.iter().cloned()),
        // A lone segment has no container of its own; it lives in the
        // identity's root `doc` container.
        Some((last, [])) => {
            segments.push("doc".to_string());
            segments.push(last.clone());
        }
        Some((last, head)) => {
            segments.push(head.join(MERGE_SEPARATOR));
            segments.push(last.clone());
        }
        None => {}
    }
    DocumentAddress { segments }
}

/// Map a logical path to the physical address of a collection.
///
/// Odd logical paths are already valid; even ones collapse into one
/// container: `planner/daily` → `planner_daily`. The items of collection
/// `a/b` are therefore exactly the documents `a/b/{id}`.
pub fn collection_address(identity: &Identity, path: &LogicalPath) -> CollectionAddress {
    let mut segments = identity_prefix(identity);
    let logical = path.segments();
    if logical.len() % 2 == 1 {
        segments.extend(logical.iter().cloned());
    } else {
        segments.push(logical.join(MERGE_SEPARATOR));
    }
    CollectionAddress { segments }
}

/// Convenience: parse and resolve a document path in one step.
pub fn resolve_document(identity: &Identity, raw: &str) -> Result<DocumentAddress> {
    Ok(document_address(identity, &LogicalPath::parse(raw)?))
}

/// Convenience: parse and resolve a collection path in one step.
pub fn resolve_collection(identity: &Identity, raw: &str) -> Result<CollectionAddress> {
    Ok(collection_address(identity, &LogicalPath::parse(raw)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Identity {
        Identity::new("u1")
    }

    fn path(raw: &str) -> LogicalPath {
        LogicalPath::parse(raw).unwrap()
    }

    // === LogicalPath ===

    #[test]
    fn parse_drops_empty_segments() {
        assert_eq!(path("/planner//daily/"), path("planner/daily"));
        assert_eq!(path("planner/daily").to_string(), "planner/daily");
    }

    #[test]
    fn parse_rejects_empty_path() {
        assert!(matches!(
            LogicalPath::parse(" / "),
            Err(SyncError::InvalidPath(_))
        ));
    }

    #[test]
    fn child_rejects_nested_segment() {
        assert!(path("tasks").child("a/b").is_err());
        assert_eq!(path("tasks").child("t1").unwrap().to_string(), "tasks/t1");
    }

    #[test]
    fn local_key_is_prefixed_logical_path() {
        assert_eq!(path("planner/monthly/2025-5").local_key(), "planner-sync:planner/monthly/2025-5");
    }

    // === document_address ===

    #[test]
    fn even_document_path_maps_verbatim() {
        let addr = document_address(&user(), &path("config/settings"));
        assert_eq!(addr.to_string(), "users/u1/config/settings");
    }

    #[test]
    fn odd_document_path_merges_all_but_last() {
        let addr = document_address(&user(), &path("planner/weekly/2025-W01"));
        assert_eq!(addr.to_string(), "users/u1/planner_weekly/2025-W01");

        let addr = document_address(&user(), &path("a/b/c/d/e"));
        assert_eq!(addr.to_string(), "users/u1/a_b_c_d/e");
    }

    #[test]
    fn single_segment_document_gets_root_container() {
        let addr = document_address(&user(), &path("profile"));
        assert_eq!(addr.to_string(), "users/u1/doc/profile");
    }

    #[test]
    fn document_addresses_are_always_even() {
        for raw in ["a", "a/b", "a/b/c", "a/b/c/d", "a/b/c/d/e"] {
            let addr = document_address(&user(), &path(raw));
            assert_eq!(addr.segments().len() % 2, 0, "odd address for {raw}: {addr}");
        }
    }

    // === collection_address ===

    #[test]
    fn odd_collection_path_maps_verbatim() {
        let addr = collection_address(&user(), &path("tasks"));
        assert_eq!(addr.to_string(), "users/u1/tasks");
    }

    #[test]
    fn even_collection_path_collapses() {
        let addr = collection_address(&user(), &path("planner/daily"));
        assert_eq!(addr.to_string(), "users/u1/planner_daily");
    }

    #[test]
    fn collection_items_match_document_paths() {
        let collection = collection_address(&user(), &path("planner/daily"));
        let via_collection = collection.document("2025-01-01").unwrap();
        let via_document = document_address(&user(), &path("planner/daily/2025-01-01"));
        assert_eq!(via_collection, via_document);
        assert_eq!(via_document.parent(), collection);
        assert_eq!(via_document.id(), "2025-01-01");
    }

    #[test]
    fn collection_addresses_are_always_odd() {
        for raw in ["a", "a/b", "a/b/c", "a/b/c/d"] {
            let addr = collection_address(&user(), &path(raw));
            assert_eq!(addr.segments().len() % 2, 1, "even address for {raw}: {addr}");
        }
    }

    #[test]
    fn identities_are_isolated() {
        let a = document_address(&Identity::new("a"), &path("config/settings"));
        let b = document_address(&Identity::new("b"), &path("config/settings"));
        assert_ne!(a, b);
    }
}
