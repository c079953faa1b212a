use super::repository::{BackupRepository, RepoInfo, TreeEntry, TreeItem};
use crate::config::BackupConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use url::Url;

const USER_AGENT: &str = concat!("planner-sync/", env!("CARGO_PKG_VERSION"));
const ACCEPT: &str = "application/vnd.github+json";

/// `BackupRepository` over the GitHub REST API (git data + contents).
pub struct GithubRepository {
    client: Client,
    base: Url,
    owner: String,
    repo: String,
    token: String,
}

impl GithubRepository {
    pub fn new(config: &BackupConfig, token: String) -> Result<Self> {
        if config.owner.trim().is_empty() || config.repo.trim().is_empty() {
            return Err(SyncError::Config("backup owner and repo must be set".to_string()));
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base: base_url(&config.api_base)?,
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base
            .join(path)
            .map_err(|e| SyncError::Config(format!("bad endpoint {path}: {e}")))?;
        Ok(self
            .client
            .request(method, url)
            .header("Accept", ACCEPT)
            .bearer_auth(&self.token))
    }

    fn repo_path(&self, rest: &str) -> String {
        format!("repos/{}/{}/{}", self.owner, self.repo, rest)
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<(StatusCode, Value)> {
        let response = builder
            .send()
            .await
            .map_err(|e| SyncError::Repository(format!("request failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SyncError::Repository(format!("reading response: {e}")))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, body))
    }

    /// `execute` that treats anything but 2xx as an error.
    async fn expect_success(&self, builder: RequestBuilder, what: &str) -> Result<Value> {
        let (status, body) = self.execute(builder).await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(api_error(what, status, &body))
        }
    }
}

fn base_url(raw: &str) -> Result<Url> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|e| SyncError::Config(format!("bad api_base {raw:?}: {e}")))
}

fn api_error(what: &str, status: StatusCode, body: &Value) -> SyncError {
    let message = body["message"].as_str().unwrap_or("no message");
    SyncError::Repository(format!("{what}: {status} {message}"))
}

/// Percent-encode each segment of a repository file path.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn sha_at(body: &Value, pointer: &str, what: &str) -> Result<String> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SyncError::Repository(format!("{what}: response has no {pointer}")))
}

/// Blob content as returned by the git data API: base64 with embedded
/// newlines, or plain text.
fn decode_content(body: &Value) -> Result<String> {
    let content = body["content"].as_str().unwrap_or_default();
    match body["encoding"].as_str() {
        Some("utf-8") => Ok(content.to_string()),
        _ => {
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = STANDARD
                .decode(compact)
                .map_err(|e| SyncError::Repository(format!("blob is not base64: {e}")))?;
            String::from_utf8(bytes).map_err(|e| SyncError::Repository(format!("blob is not utf-8: {e}")))
        }
    }
}

#[async_trait]
impl BackupRepository for GithubRepository {
    async fn repository(&self) -> Result<Option<RepoInfo>> {
        let (status, body) = self
            .execute(self.request(Method::GET, &format!("repos/{}/{}", self.owner, self.repo))?)
            .await?;
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(RepoInfo {
                default_branch: body["default_branch"].as_str().unwrap_or("main").to_string(),
                private: body["private"].as_bool().unwrap_or(true),
            })),
            s => Err(api_error("get repository", s, &body)),
        }
    }

    async fn create_repository(&self, private: bool) -> Result<RepoInfo> {
        let me = self
            .expect_success(self.request(Method::GET, "user")?, "get user")
            .await?;
        let path = if me["login"].as_str() == Some(self.owner.as_str()) {
            "user/repos".to_string()
        } else {
            format!("orgs/{}/repos", self.owner)
        };
        let body = json!({
            "name": self.repo,
            "private": private,
            "auto_init": true,
            "description": "Planner backup",
        });
        let created = self
            .expect_success(self.request(Method::POST, &path)?.json(&body), "create repository")
            .await
            .map_err(|e| SyncError::RepositoryBootstrapFailed(e.to_string()))?;
        tracing::info!("Created backup repository {}/{}", self.owner, self.repo);
        Ok(RepoInfo {
            default_branch: created["default_branch"].as_str().unwrap_or("main").to_string(),
            private,
        })
    }

    async fn get_ref(&self, branch: &str) -> Result<Option<String>> {
        let path = self.repo_path(&format!("git/ref/heads/{branch}"));
        let (status, body) = self.execute(self.request(Method::GET, &path)?).await?;
        match status {
            // 409: "Git Repository is empty."
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(None),
            s if s.is_success() => sha_at(&body, "/object/sha", "get ref").map(Some),
            s => Err(api_error("get ref", s, &body)),
        }
    }

    async fn create_ref(&self, branch: &str, commit: &str) -> Result<()> {
        let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": commit });
        let (status, body) = self
            .execute(self.request(Method::POST, &self.repo_path("git/refs"))?.json(&body))
            .await?;
        match status {
            StatusCode::UNPROCESSABLE_ENTITY => Err(SyncError::RefConflict {
                branch: branch.to_string(),
            }),
            s if s.is_success() => Ok(()),
            s => Err(api_error("create ref", s, &body)),
        }
    }

    async fn update_ref(&self, branch: &str, commit: &str) -> Result<()> {
        let body = json!({ "sha": commit, "force": false });
        let path = self.repo_path(&format!("git/refs/heads/{branch}"));
        let (status, body) = self
            .execute(self.request(Method::PATCH, &path)?.json(&body))
            .await?;
        match status {
            // "Update is not a fast forward"
            StatusCode::UNPROCESSABLE_ENTITY => Err(SyncError::RefConflict {
                branch: branch.to_string(),
            }),
            s if s.is_success() => Ok(()),
            s => Err(api_error("update ref", s, &body)),
        }
    }

    async fn commit_tree(&self, commit: &str) -> Result<String> {
        let path = self.repo_path(&format!("git/commits/{commit}"));
        let body = self
            .expect_success(self.request(Method::GET, &path)?, "get commit")
            .await?;
        sha_at(&body, "/tree/sha", "get commit")
    }

    async fn create_tree(&self, base_tree: Option<&str>, entries: &[TreeEntry]) -> Result<String> {
        let body = tree_body(base_tree, entries);
        let created = self
            .expect_success(
                self.request(Method::POST, &self.repo_path("git/trees"))?.json(&body),
                "create tree",
            )
            .await?;
        sha_at(&created, "/sha", "create tree")
    }

    async fn create_commit(&self, message: &str, tree: &str, parents: &[String]) -> Result<String> {
        let body = json!({ "message": message, "tree": tree, "parents": parents });
        let created = self
            .expect_success(
                self.request(Method::POST, &self.repo_path("git/commits"))?.json(&body),
                "create commit",
            )
            .await?;
        sha_at(&created, "/sha", "create commit")
    }

    async fn list_tree(&self, tree: &str) -> Result<Vec<TreeItem>> {
        let path = self.repo_path(&format!("git/trees/{tree}?recursive=1"));
        let body = self
            .expect_success(self.request(Method::GET, &path)?, "list tree")
            .await?;
        if body["truncated"].as_bool() == Some(true) {
            tracing::warn!("Tree listing for {} was truncated by the host", tree);
        }
        Ok(body["tree"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter(|item| item["type"] == "blob")
            .filter_map(|item| {
                Some(TreeItem {
                    path: item["path"].as_str()?.to_string(),
                    sha: item["sha"].as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn read_blob(&self, sha: &str) -> Result<String> {
        let path = self.repo_path(&format!("git/blobs/{sha}"));
        let body = self
            .expect_success(self.request(Method::GET, &path)?, "read blob")
            .await?;
        decode_content(&body)
    }

    async fn put_file(&self, branch: &str, path: &str, content: &str, message: &str) -> Result<String> {
        let body = json!({
            "message": message,
            "content": STANDARD.encode(content),
            "branch": branch,
        });
        let created = self
            .expect_success(
                self.request(Method::PUT, &self.repo_path(&format!("contents/{}", encode_path(path))))?
                    .json(&body),
                "write file",
            )
            .await?;
        sha_at(&created, "/commit/sha", "write file")
    }
}

fn tree_body(base_tree: Option<&str>, entries: &[TreeEntry]) -> Value {
    let tree: Vec<Value> = entries
        .iter()
        .map(|e| json!({ "path": e.path, "mode": e.mode, "type": e.kind, "content": e.content }))
        .collect();
    let mut body = json!({ "tree": tree });
    if let Some(base) = base_tree {
        body["base_tree"] = json!(base);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackupConfig {
        BackupConfig {
            owner: "me".into(),
            repo: "backup".into(),
            ..Default::default()
        }
    }

    #[test]
    fn endpoints_join_under_api_base() {
        let mut cfg = config();
        cfg.api_base = "https://ghe.example.com/api/v3".into();
        let repo = GithubRepository::new(&cfg, "t".into()).unwrap();
        let url = repo.base.join(&repo.repo_path("git/refs")).unwrap();
        assert_eq!(url.as_str(), "https://ghe.example.com/api/v3/repos/me/backup/git/refs");
    }

    #[test]
    fn missing_owner_is_a_config_error() {
        let cfg = BackupConfig::default();
        assert!(matches!(
            GithubRepository::new(&cfg, "t".into()),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn tree_body_carries_each_entry_type() {
        let body = tree_body(Some("base"), &[TreeEntry::blob("a.md", "x")]);
        assert_eq!(body["base_tree"], json!("base"));
        assert_eq!(
            body["tree"][0],
            json!({ "path": "a.md", "mode": "100644", "type": "blob", "content": "x" })
        );
        assert!(tree_body(None, &[]).get("base_tree").is_none());
    }

    #[test]
    fn file_paths_are_encoded_per_segment() {
        assert_eq!(encode_path("2025/01/My notes.md"), "2025/01/My%20notes.md");
    }

    #[test]
    fn decodes_wrapped_base64_blobs() {
        let body = json!({ "content": "aGVs\nbG8=\n", "encoding": "base64" });
        assert_eq!(decode_content(&body).unwrap(), "hello");
        let plain = json!({ "content": "hi", "encoding": "utf-8" });
        assert_eq!(decode_content(&plain).unwrap(), "hi");
    }

    #[test]
    fn api_errors_carry_status_and_message() {
        let err = api_error("get ref", StatusCode::FORBIDDEN, &json!({"message": "rate limited"}));
        assert_eq!(err.to_string(), "backup repository error: get ref: 403 Forbidden rate limited");
    }
}
