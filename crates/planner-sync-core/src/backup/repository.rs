use crate::error::{Result, SyncError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

pub const BLOB_MODE: &str = "100644";
pub const BLOB_TYPE: &str = "blob";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoInfo {
    pub default_branch: String,
    pub private: bool,
}

/// A file to place in a new tree. The repository creates the blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub mode: String,
    /// Git object type (`blob`, `tree`, `commit`).
    pub kind: String,
    pub content: String,
}

impl TreeEntry {
    pub fn blob(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: BLOB_MODE.to_string(),
            kind: BLOB_TYPE.to_string(),
            content: content.into(),
        }
    }
}

/// One blob from a recursive tree listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeItem {
    pub path: String,
    pub sha: String,
}

/// External git-like store the backup lives in.
#[async_trait]
pub trait BackupRepository: Send + Sync {
    /// `None` if the repository does not exist.
    async fn repository(&self) -> Result<Option<RepoInfo>>;

    /// Create the repository, asking the host to auto-initialize it.
    async fn create_repository(&self, private: bool) -> Result<RepoInfo>;

    /// Head commit of `branch`, or `None` if the branch has no commits.
    async fn get_ref(&self, branch: &str) -> Result<Option<String>>;

    async fn create_ref(&self, branch: &str, commit: &str) -> Result<()>;

    /// Fast-forward `branch` to `commit`. A branch that moved elsewhere is
    /// `SyncError::RefConflict`.
    async fn update_ref(&self, branch: &str, commit: &str) -> Result<()>;

    /// Root tree of a commit.
    async fn commit_tree(&self, commit: &str) -> Result<String>;

    async fn create_tree(&self, base_tree: Option<&str>, entries: &[TreeEntry]) -> Result<String>;

    async fn create_commit(&self, message: &str, tree: &str, parents: &[String]) -> Result<String>;

    /// Every blob reachable from `tree`, with full paths.
    async fn list_tree(&self, tree: &str) -> Result<Vec<TreeItem>>;

    async fn read_blob(&self, sha: &str) -> Result<String>;

    /// Single-file write that creates a commit on `branch` (and the branch
    /// itself if the repository is empty). Returns the new commit.
    async fn put_file(&self, branch: &str, path: &str, content: &str, message: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Object {
    Blob(String),
    /// path -> blob sha; trees are kept flat.
    Tree(BTreeMap<String, String>),
    Commit {
        tree: String,
        parents: Vec<String>,
        message: String,
    },
}

#[derive(Default)]
struct RepoState {
    info: Option<RepoInfo>,
    auto_init: bool,
    objects: HashMap<String, Object>,
    refs: BTreeMap<String, String>,
    sequence: u64,
    put_file_calls: usize,
    fail_put_file: bool,
    /// Applied to the branch right before the next `create_commit`,
    /// simulating a concurrent writer.
    interference: Option<(String, String, String)>,
}

impl RepoState {
    fn hash(&mut self, kind: &str, body: &str) -> String {
        self.sequence += 1;
        let digest = Sha256::digest(format!("{kind}\0{}\0{body}", self.sequence).as_bytes());
        format!("{:x}", digest)[..40].to_string()
    }

    fn blob(&mut self, content: &str) -> String {
        let sha = self.hash("blob", content);
        self.objects.insert(sha.clone(), Object::Blob(content.to_string()));
        sha
    }

    fn tree_entries(&self, sha: &str) -> Result<BTreeMap<String, String>> {
        match self.objects.get(sha) {
            Some(Object::Tree(entries)) => Ok(entries.clone()),
            _ => Err(SyncError::Repository(format!("tree {sha} not found"))),
        }
    }

    fn tree(&mut self, entries: BTreeMap<String, String>) -> String {
        let body = entries
            .iter()
            .map(|(path, sha)| format!("{BLOB_MODE} {path} {sha}"))
            .collect::<Vec<_>>()
            .join("\n");
        let sha = self.hash("tree", &body);
        self.objects.insert(sha.clone(), Object::Tree(entries));
        sha
    }

    fn commit(&mut self, message: &str, tree: &str, parents: &[String]) -> Result<String> {
        if !matches!(self.objects.get(tree), Some(Object::Tree(_))) {
            return Err(SyncError::Repository(format!("tree {tree} not found")));
        }
        for parent in parents {
            if !matches!(self.objects.get(parent), Some(Object::Commit { .. })) {
                return Err(SyncError::Repository(format!("parent {parent} not found")));
            }
        }
        let sha = self.hash("commit", &format!("{tree} {} {message}", parents.join(",")));
        self.objects.insert(
            sha.clone(),
            Object::Commit {
                tree: tree.to_string(),
                parents: parents.to_vec(),
                message: message.to_string(),
            },
        );
        Ok(sha)
    }

    fn commit_tree(&self, commit: &str) -> Result<String> {
        match self.objects.get(commit) {
            Some(Object::Commit { tree, .. }) => Ok(tree.clone()),
            _ => Err(SyncError::Repository(format!("commit {commit} not found"))),
        }
    }

    fn parents(&self, commit: &str) -> Vec<String> {
        match self.objects.get(commit) {
            Some(Object::Commit { parents, .. }) => parents.clone(),
            _ => Vec::new(),
        }
    }

    fn is_ancestor(&self, ancestor: &str, commit: &str) -> bool {
        let mut pending = vec![commit.to_string()];
        while let Some(sha) = pending.pop() {
            if sha == ancestor {
                return true;
            }
            pending.extend(self.parents(&sha));
        }
        false
    }

    /// Commit one file onto `branch` (or start the branch).
    fn write_file(&mut self, branch: &str, path: &str, content: &str, message: &str) -> Result<String> {
        let head = self.refs.get(branch).cloned();
        let mut entries = match &head {
            Some(head) => {
                let tree = self.commit_tree(head)?;
                self.tree_entries(&tree)?
            }
            None => BTreeMap::new(),
        };
        let blob = self.blob(content);
        entries.insert(path.to_string(), blob);
        let tree = self.tree(entries);
        let parents: Vec<String> = head.into_iter().collect();
        let commit = self.commit(message, &tree, &parents)?;
        self.refs.insert(branch.to_string(), commit.clone());
        Ok(commit)
    }
}

/// Git object model in memory: blobs, flat trees, commits and branch refs
/// with fast-forward checks. Backs the pipeline tests.
pub struct InMemoryRepository {
    state: Mutex<RepoState>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    /// Existing repository with no commits.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RepoState {
                info: Some(RepoInfo {
                    default_branch: "main".to_string(),
                    private: true,
                }),
                ..Default::default()
            }),
        }
    }

    /// Repository that does not exist yet. Creating it yields an empty
    /// repository unless `auto_init` is set.
    pub fn missing(auto_init: bool) -> Self {
        Self {
            state: Mutex::new(RepoState {
                auto_init,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RepoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_put_file(&self, fail: bool) {
        self.lock().fail_put_file = fail;
    }

    pub fn put_file_calls(&self) -> usize {
        self.lock().put_file_calls
    }

    pub fn head(&self, branch: &str) -> Option<String> {
        self.lock().refs.get(branch).cloned()
    }

    pub fn parents(&self, commit: &str) -> Vec<String> {
        self.lock().parents(commit)
    }

    /// Commits on `branch`, newest first, following first parents.
    pub fn history(&self, branch: &str) -> Vec<String> {
        let state = self.lock();
        let mut history = Vec::new();
        let mut next = state.refs.get(branch).cloned();
        while let Some(sha) = next {
            next = state.parents(&sha).into_iter().next();
            history.push(sha);
        }
        history
    }

    pub fn commit_message(&self, commit: &str) -> Option<String> {
        match self.lock().objects.get(commit) {
            Some(Object::Commit { message, .. }) => Some(message.clone()),
            _ => None,
        }
    }

    /// Content of `path` at the head of `branch`.
    pub fn file(&self, branch: &str, path: &str) -> Option<String> {
        let state = self.lock();
        let head = state.refs.get(branch)?;
        let tree = state.commit_tree(head).ok()?;
        let blob = state.tree_entries(&tree).ok()?.get(path)?.clone();
        match state.objects.get(&blob) {
            Some(Object::Blob(content)) => Some(content.clone()),
            _ => None,
        }
    }

    /// Files at the head of `branch`, path -> content.
    pub fn files(&self, branch: &str) -> BTreeMap<String, String> {
        let paths: Vec<String> = {
            let state = self.lock();
            let Some(head) = state.refs.get(branch) else {
                return BTreeMap::new();
            };
            state
                .commit_tree(head)
                .and_then(|tree| state.tree_entries(&tree))
                .map(|entries| entries.into_keys().collect())
                .unwrap_or_default()
        };
        paths
            .into_iter()
            .filter_map(|path| self.file(branch, &path).map(|content| (path, content)))
            .collect()
    }

    /// Commit directly to `branch` as an outside writer would.
    pub fn external_commit(&self, branch: &str, path: &str, content: &str) -> Result<String> {
        self.lock().write_file(branch, path, content, "external change")
    }

    /// Make an outside writer move `branch` right before the next
    /// `create_commit` call.
    pub fn interfere_before_next_commit(&self, branch: &str, path: &str, content: &str) {
        self.lock().interference = Some((branch.to_string(), path.to_string(), content.to_string()));
    }
}

#[async_trait]
impl BackupRepository for InMemoryRepository {
    async fn repository(&self) -> Result<Option<RepoInfo>> {
        Ok(self.lock().info.clone())
    }

    async fn create_repository(&self, private: bool) -> Result<RepoInfo> {
        let mut state = self.lock();
        if state.info.is_some() {
            return Err(SyncError::Repository("repository already exists".to_string()));
        }
        let info = RepoInfo {
            default_branch: "main".to_string(),
            private,
        };
        state.info = Some(info.clone());
        if state.auto_init {
            state.write_file(&info.default_branch, "README.md", "# Planner backup\n", "Initial commit")?;
        }
        Ok(info)
    }

    async fn get_ref(&self, branch: &str) -> Result<Option<String>> {
        Ok(self.lock().refs.get(branch).cloned())
    }

    async fn create_ref(&self, branch: &str, commit: &str) -> Result<()> {
        let mut state = self.lock();
        if state.refs.contains_key(branch) {
            return Err(SyncError::RefConflict {
                branch: branch.to_string(),
            });
        }
        state.commit_tree(commit)?;
        state.refs.insert(branch.to_string(), commit.to_string());
        Ok(())
    }

    async fn update_ref(&self, branch: &str, commit: &str) -> Result<()> {
        let mut state = self.lock();
        let Some(current) = state.refs.get(branch).cloned() else {
            return Err(SyncError::Repository(format!("branch {branch} not found")));
        };
        if !state.is_ancestor(&current, commit) {
            return Err(SyncError::RefConflict {
                branch: branch.to_string(),
            });
        }
        state.refs.insert(branch.to_string(), commit.to_string());
        Ok(())
    }

    async fn commit_tree(&self, commit: &str) -> Result<String> {
        self.lock().commit_tree(commit)
    }

    async fn create_tree(&self, base_tree: Option<&str>, entries: &[TreeEntry]) -> Result<String> {
        let mut state = self.lock();
        let mut tree = match base_tree {
            Some(base) => state.tree_entries(base)?,
            None => BTreeMap::new(),
        };
        for entry in entries {
            if entry.kind != BLOB_TYPE {
                return Err(SyncError::Repository(format!(
                    "unsupported tree entry type {} for {}",
                    entry.kind, entry.path
                )));
            }
            let blob = state.blob(&entry.content);
            tree.insert(entry.path.clone(), blob);
        }
        Ok(state.tree(tree))
    }

    async fn create_commit(&self, message: &str, tree: &str, parents: &[String]) -> Result<String> {
        let mut state = self.lock();
        if let Some((branch, path, content)) = state.interference.take() {
            state.write_file(&branch, &path, &content, "concurrent change")?;
        }
        state.commit(message, tree, parents)
    }

    async fn list_tree(&self, tree: &str) -> Result<Vec<TreeItem>> {
        let entries = self.lock().tree_entries(tree)?;
        Ok(entries
            .into_iter()
            .map(|(path, sha)| TreeItem { path, sha })
            .collect())
    }

    async fn read_blob(&self, sha: &str) -> Result<String> {
        match self.lock().objects.get(sha) {
            Some(Object::Blob(content)) => Ok(content.clone()),
            _ => Err(SyncError::Repository(format!("blob {sha} not found"))),
        }
    }

    async fn put_file(&self, branch: &str, path: &str, content: &str, message: &str) -> Result<String> {
        let mut state = self.lock();
        state.put_file_calls += 1;
        if state.fail_put_file {
            return Err(SyncError::Repository("content write rejected".to_string()));
        }
        if state.info.is_none() {
            return Err(SyncError::Repository("repository not found".to_string()));
        }
        state.write_file(branch, path, content, message)
    }
}
