use super::format::{
    daily_path, monthly_path, monthly_title, render_daily, render_period, yearly_path, yearly_title,
    DailyPage, ExportFile,
};
use super::repository::{BackupRepository, TreeEntry};
use crate::address::{collection_address, document_address, LogicalPath};
use crate::config::BackupConfig;
use crate::error::{Result, SyncError};
use crate::identity::{require, Identity};
use crate::model::{
    parse_date, DailyNote, JournalAnswers, LogEntries, MonthId, PeriodPlan, PlannerState, Task,
    DAILY_NOTES, JOURNAL_ANSWERS, JOURNAL_LOG, MONTHLY_PLANS, TASKS, YEARLY_PLANS,
};
use crate::store::{RemoteStore, StoredDocument};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

const SEED_CONTENT: &str = "# Planner backup\n\nDaily pages and overviews exported by planner-sync.\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportStage {
    Idle,
    Fetching,
    Formatting,
    Pushing,
    CreatingRepo,
    Success,
    Error,
}

impl ExportStage {
    pub fn label(&self) -> &'static str {
        match self {
            ExportStage::Idle => "idle",
            ExportStage::Fetching => "fetching",
            ExportStage::Formatting => "formatting",
            ExportStage::Pushing => "pushing",
            ExportStage::CreatingRepo => "creating_repo",
            ExportStage::Success => "success",
            ExportStage::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportReport {
    pub files: usize,
    pub branch: String,
    pub commit: String,
    /// The branch had no commits and was seeded first.
    pub bootstrapped: bool,
    pub created_repository: bool,
}

#[derive(Clone, Debug)]
pub struct ExportOptions {
    /// Defaults to the repository's default branch.
    pub branch: Option<String>,
    pub private: bool,
    pub seed_path: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self::from(&BackupConfig::default())
    }
}

impl From<&BackupConfig> for ExportOptions {
    fn from(config: &BackupConfig) -> Self {
        Self {
            branch: config.branch.clone(),
            private: config.private,
            seed_path: config.seed_path.clone(),
        }
    }
}

/// Files to commit, bound to the head they were planned against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitPlan {
    pub branch: String,
    pub parent: String,
    pub base_tree: String,
    pub entries: Vec<TreeEntry>,
    /// The branch does not exist yet and will be created at the new commit.
    pub create_ref: bool,
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

fn decode<T: DeserializeOwned>(what: &str, doc: StoredDocument) -> Option<(String, T)> {
    match serde_json::from_value(doc.data) {
        Ok(value) => Some((doc.id, value)),
        Err(e) => {
            tracing::warn!("Skipping unreadable {} {}: {}", what, doc.id, e);
            None
        }
    }
}

/// One-time reads of everything the backup covers. Never subscribes.
pub async fn fetch_state(store: &dyn RemoteStore, identity: &Identity) -> Result<PlannerState> {
    let collection = |raw: &str| -> Result<_> { Ok(collection_address(identity, &LogicalPath::parse(raw)?)) };
    let document = |raw: &str| -> Result<_> { Ok(document_address(identity, &LogicalPath::parse(raw)?)) };

    let mut state = PlannerState::default();

    state.tasks = store
        .get_collection(&collection(TASKS)?)
        .await?
        .into_iter()
        .filter_map(|doc| decode::<Task>("task", doc))
        .collect();

    for (id, note) in store
        .get_collection(&collection(DAILY_NOTES)?)
        .await?
        .into_iter()
        .filter_map(|doc| decode::<DailyNote>("daily note", doc))
    {
        match parse_date(&id) {
            Some(date) => {
                state.daily_notes.insert(date, note);
            }
            None => tracing::warn!("Skipping daily note with non-date key {}", id),
        }
    }

    for (id, plan) in store
        .get_collection(&collection(MONTHLY_PLANS)?)
        .await?
        .into_iter()
        .filter_map(|doc| decode::<PeriodPlan>("monthly plan", doc))
    {
        match MonthId::parse(&id) {
            Some(month) => {
                state.monthly_plans.insert(month, plan);
            }
            None => tracing::warn!("Skipping monthly plan with non-month key {}", id),
        }
    }

    for (id, plan) in store
        .get_collection(&collection(YEARLY_PLANS)?)
        .await?
        .into_iter()
        .filter_map(|doc| decode::<PeriodPlan>("yearly plan", doc))
    {
        match id.parse::<i32>() {
            Ok(year) => {
                state.yearly_plans.insert(year, plan);
            }
            Err(_) => tracing::warn!("Skipping yearly plan with non-year key {}", id),
        }
    }

    if let Some(Value::Object(days)) = store.get(&document(JOURNAL_ANSWERS)?).await? {
        state.journal = journal_from_value(days);
    }
    if let Some(Value::Object(days)) = store.get(&document(JOURNAL_LOG)?).await? {
        state.log = days.into_iter().collect::<LogEntries>();
    }

    tracing::info!(
        "Fetched {} tasks, {} notes, {} monthly and {} yearly plans",
        state.tasks.len(),
        state.daily_notes.len(),
        state.monthly_plans.len(),
        state.yearly_plans.len()
    );
    Ok(state)
}

fn journal_from_value(days: serde_json::Map<String, Value>) -> JournalAnswers {
    days.into_iter()
        .filter_map(|(day, answers)| match answers {
            Value::Object(answers) => Some((
                day,
                answers
                    .into_iter()
                    .map(|(prompt, answer)| match answer {
                        Value::String(text) => (prompt, text),
                        other => (prompt, other.to_string()),
                    })
                    .collect(),
            )),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Render
// ---------------------------------------------------------------------------

/// Group state into daily pages and overviews.
pub fn render_state(state: &PlannerState) -> Vec<ExportFile> {
    let mut days: BTreeMap<NaiveDate, DailyPage> = BTreeMap::new();

    for (id, task) in &state.tasks {
        match task.date.as_deref().and_then(parse_date) {
            Some(date) => days.entry(date).or_default().tasks.push(task.clone()),
            None => tracing::debug!("Task {} has no date and is not exported", id),
        }
    }
    for (date, note) in &state.daily_notes {
        if !note.content.trim().is_empty() {
            days.entry(*date).or_default().note = Some(note.clone());
        }
    }
    for (day, answers) in &state.journal {
        if let Some(date) = parse_date(day) {
            days.entry(date).or_default().journal.extend(answers.clone());
        }
    }
    for (day, entry) in &state.log {
        if let Some(date) = parse_date(day) {
            days.entry(date).or_default().log = Some(entry.clone());
        }
    }

    let mut files: Vec<ExportFile> = days
        .iter()
        .filter(|(_, page)| !page.is_empty())
        .map(|(date, page)| ExportFile {
            path: daily_path(*date),
            content: render_daily(*date, page),
        })
        .collect();

    files.extend(
        state
            .monthly_plans
            .iter()
            .filter(|(_, plan)| !plan.is_empty())
            .map(|(month, plan)| ExportFile {
                path: monthly_path(month),
                content: render_period(&monthly_title(month), plan),
            }),
    );
    files.extend(
        state
            .yearly_plans
            .iter()
            .filter(|(_, plan)| !plan.is_empty())
            .map(|(year, plan)| ExportFile {
                path: yearly_path(*year),
                content: render_period(&yearly_title(*year), plan),
            }),
    );
    files
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct ExportPipeline {
    store: Arc<dyn RemoteStore>,
    repo: Arc<dyn BackupRepository>,
    options: ExportOptions,
    progress: watch::Sender<ExportStage>,
}

impl ExportPipeline {
    pub fn new(store: Arc<dyn RemoteStore>, repo: Arc<dyn BackupRepository>, options: ExportOptions) -> Self {
        let (progress, _) = watch::channel(ExportStage::Idle);
        Self {
            store,
            repo,
            options,
            progress,
        }
    }

    pub fn progress(&self) -> watch::Receiver<ExportStage> {
        self.progress.subscribe()
    }

    fn stage(&self, stage: ExportStage) {
        tracing::info!("Export: {}", stage.label());
        self.progress.send_replace(stage);
    }

    pub async fn run(&self, identity: Option<&Identity>) -> Result<ExportReport> {
        let result = self.export(identity).await;
        match &result {
            Ok(report) => {
                self.stage(ExportStage::Success);
                tracing::info!(
                    "Exported {} files to {} at {}",
                    report.files,
                    report.branch,
                    report.commit
                );
            }
            Err(e) => {
                self.stage(ExportStage::Error);
                tracing::warn!("Export failed ({}): {}", e.kind(), e);
            }
        }
        result
    }

    async fn export(&self, identity: Option<&Identity>) -> Result<ExportReport> {
        let identity = require(identity)?;

        self.stage(ExportStage::Fetching);
        let state = fetch_state(self.store.as_ref(), identity).await?;

        self.stage(ExportStage::Formatting);
        let files = render_state(&state);

        self.stage(ExportStage::Pushing);
        let mut created_repository = false;
        let info = match self.repo.repository().await? {
            Some(info) => info,
            None => {
                self.stage(ExportStage::CreatingRepo);
                created_repository = true;
                let info = self.repo.create_repository(self.options.private).await.map_err(|e| match e {
                    SyncError::RepositoryBootstrapFailed(_) => e,
                    other => SyncError::RepositoryBootstrapFailed(other.to_string()),
                })?;
                self.stage(ExportStage::Pushing);
                info
            }
        };
        let branch = self.options.branch.clone().unwrap_or_else(|| info.default_branch.clone());

        let bootstrapped = self.bootstrap(&branch, &info.default_branch).await?;

        let plan = self.plan(&branch, &info.default_branch, &files).await?;
        let commit = self.commit(&plan, files.len()).await?;

        Ok(ExportReport {
            files: files.len(),
            branch,
            commit,
            bootstrapped,
            created_repository,
        })
    }

    /// Give a repository with no commits a base tree to build on. Returns
    /// whether a seed commit was made.
    async fn bootstrap(&self, branch: &str, default_branch: &str) -> Result<bool> {
        if self.repo.get_ref(branch).await?.is_some() || self.repo.get_ref(default_branch).await?.is_some() {
            return Ok(false);
        }
        tracing::info!("Backup branch {} has no commits; seeding {}", branch, self.options.seed_path);
        self.repo
            .put_file(branch, &self.options.seed_path, SEED_CONTENT, "Initialize planner backup")
            .await
            .map_err(|e| SyncError::RepositoryBootstrapFailed(e.to_string()))?;
        if self.repo.get_ref(branch).await?.is_none() {
            return Err(SyncError::RepositoryBootstrapFailed(format!(
                "seed commit did not create branch {branch}"
            )));
        }
        Ok(true)
    }

    /// Resolve the head as late as possible and build the plan against it.
    async fn plan(&self, branch: &str, default_branch: &str, files: &[ExportFile]) -> Result<CommitPlan> {
        let (parent, create_ref) = match self.repo.get_ref(branch).await? {
            Some(head) => (head, false),
            None => match self.repo.get_ref(default_branch).await? {
                Some(head) => (head, true),
                None => {
                    return Err(SyncError::RepositoryBootstrapFailed(format!(
                        "branch {branch} has no commits"
                    )))
                }
            },
        };
        let base_tree = self.repo.commit_tree(&parent).await?;
        Ok(CommitPlan {
            branch: branch.to_string(),
            parent,
            base_tree,
            entries: files
                .iter()
                .map(|file| TreeEntry::blob(file.path.clone(), file.content.clone()))
                .collect(),
            create_ref,
        })
    }

    async fn commit(&self, plan: &CommitPlan, files: usize) -> Result<String> {
        let tree = self.repo.create_tree(Some(&plan.base_tree), &plan.entries).await?;
        let message = format!(
            "Planner backup {} ({} files)",
            chrono::Utc::now().format("%Y-%m-%d %H:%M UTC"),
            files
        );
        let commit = self
            .repo
            .create_commit(&message, &tree, std::slice::from_ref(&plan.parent))
            .await?;
        // TODO: re-plan and retry once on RefConflict instead of surfacing it.
        if plan.create_ref {
            self.repo.create_ref(&plan.branch, &commit).await?;
        } else {
            self.repo.update_ref(&plan.branch, &commit).await?;
        }
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::repository::InMemoryRepository;
    use crate::memory_store::MemoryStore;
    use crate::model::Goal;
    use crate::store::SetOptions;
    use serde_json::json;

    fn user() -> Identity {
        Identity::new("u1")
    }

    async fn put(store: &MemoryStore, raw: &str, value: Value) {
        let address = crate::address::resolve_document(&user(), raw).unwrap();
        store.set(&address, value, SetOptions::merge()).await.unwrap();
    }

    // === render ===

    #[test]
    fn render_groups_by_day_month_and_year() {
        let day = parse_date("2025-01-01").unwrap();
        let mut state = PlannerState::default();
        state.tasks.push((
            "t1".into(),
            Task {
                name: "X".into(),
                priority: "P1".into(),
                completed: false,
                date: Some("2025-01-01".into()),
                tag: None,
            },
        ));
        state.tasks.push((
            "undated".into(),
            Task {
                name: "someday".into(),
                priority: String::new(),
                completed: false,
                date: None,
                tag: None,
            },
        ));
        state.daily_notes.insert(day, DailyNote { content: "hello".into() });
        state.monthly_plans.insert(
            MonthId::parse("2025-01").unwrap(),
            PeriodPlan {
                goals: vec![Goal { text: "Run".into(), completed: false }],
                ..Default::default()
            },
        );
        state.yearly_plans.insert(2025, PeriodPlan::default());

        let files = render_state(&state);
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["2025/01/2025-01-01.md", "2025/01/2025-01-Overview.md"]);
        assert!(files[0].content.contains("- [ ] X"));
        assert!(!files[0].content.contains("someday"));
    }

    // === pipeline ===

    #[tokio::test]
    async fn export_requires_identity() {
        let pipeline = ExportPipeline::new(
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryRepository::new()),
            ExportOptions::default(),
        );
        let err = pipeline.run(None).await.unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated));
        assert_eq!(*pipeline.progress().borrow(), ExportStage::Error);
    }

    #[tokio::test]
    async fn export_commits_on_top_of_existing_history() {
        let store = Arc::new(MemoryStore::new());
        put(&store, "planner/daily/2025-01-01", json!({"content": "hello"})).await;
        let repo = Arc::new(InMemoryRepository::new());
        let seed = repo.external_commit("main", "README.md", "mine").unwrap();

        let pipeline = ExportPipeline::new(store, repo.clone(), ExportOptions::default());
        let report = pipeline.run(Some(&user())).await.unwrap();

        assert!(!report.bootstrapped);
        assert_eq!(report.files, 1);
        assert_eq!(repo.parents(&report.commit), vec![seed]);
        assert_eq!(repo.file("main", "README.md").as_deref(), Some("mine"));
        assert!(repo.file("main", "2025/01/2025-01-01.md").unwrap().contains("hello"));
        assert_eq!(*pipeline.progress().borrow(), ExportStage::Success);
    }

    #[tokio::test]
    async fn missing_repository_is_created_then_seeded() {
        let repo = Arc::new(InMemoryRepository::missing(false));
        let pipeline = ExportPipeline::new(Arc::new(MemoryStore::new()), repo.clone(), ExportOptions::default());
        let report = pipeline.run(Some(&user())).await.unwrap();
        assert!(report.created_repository);
        assert!(report.bootstrapped);
        assert_eq!(repo.history("main").len(), 2);
    }

    #[tokio::test]
    async fn auto_initialized_repository_needs_no_seed() {
        let repo = Arc::new(InMemoryRepository::missing(true));
        let pipeline = ExportPipeline::new(Arc::new(MemoryStore::new()), repo.clone(), ExportOptions::default());
        let report = pipeline.run(Some(&user())).await.unwrap();
        assert!(report.created_repository);
        assert!(!report.bootstrapped);
        assert_eq!(repo.put_file_calls(), 0);
    }

    #[tokio::test]
    async fn failed_seed_aborts_export() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.fail_put_file(true);
        let pipeline = ExportPipeline::new(Arc::new(MemoryStore::new()), repo.clone(), ExportOptions::default());
        let err = pipeline.run(Some(&user())).await.unwrap_err();
        assert!(matches!(err, SyncError::RepositoryBootstrapFailed(_)));
        assert_eq!(repo.head("main"), None);
    }

    #[tokio::test]
    async fn branch_moving_mid_export_is_a_ref_conflict() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.external_commit("main", "README.md", "mine").unwrap();
        repo.interfere_before_next_commit("main", "other.md", "theirs");

        let pipeline = ExportPipeline::new(Arc::new(MemoryStore::new()), repo.clone(), ExportOptions::default());
        let err = pipeline.run(Some(&user())).await.unwrap_err();
        assert!(matches!(err, SyncError::RefConflict { ref branch } if branch == "main"));
        assert_eq!(repo.file("main", "other.md").as_deref(), Some("theirs"));
    }

    #[tokio::test]
    async fn new_branch_is_created_from_default_branch() {
        let repo = Arc::new(InMemoryRepository::new());
        let seed = repo.external_commit("main", "README.md", "mine").unwrap();
        let options = ExportOptions {
            branch: Some("backup".into()),
            ..Default::default()
        };
        let pipeline = ExportPipeline::new(Arc::new(MemoryStore::new()), repo.clone(), options);
        let report = pipeline.run(Some(&user())).await.unwrap();
        assert_eq!(report.branch, "backup");
        assert_eq!(repo.head("backup"), Some(report.commit.clone()));
        assert_eq!(repo.head("main"), Some(seed.clone()));
        assert_eq!(repo.parents(&report.commit), vec![seed]);
    }
}
