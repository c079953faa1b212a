use super::format::{classify, parse_daily, parse_period, BackupFile};
use super::repository::BackupRepository;
use crate::address::{resolve_collection, resolve_document};
use crate::error::{Result, SyncError};
use crate::identity::{require, Identity};
use crate::model::{
    format_date, JournalAnswers, LogEntries, DAILY_NOTES, JOURNAL_ANSWERS, JOURNAL_LOG, MONTHLY_PLANS, TASKS,
    YEARLY_PLANS,
};
use crate::store::{RemoteStore, SetOptions, WriteBatch};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub files_parsed: usize,
    pub files_skipped: usize,
    pub operations_written: usize,
    pub batches_committed: usize,
}

/// Same task in the same file always maps to the same document, so a
/// repeated import overwrites instead of duplicating. `occurrence` counts
/// earlier tasks in the file with the same priority and name.
pub fn imported_task_id(date: &str, priority: &str, name: &str, occurrence: usize) -> String {
    let mut input = format!("{date}\n{priority}\n{name}");
    if occurrence > 0 {
        input.push_str(&format!("\n{occurrence}"));
    }
    let digest = Sha256::digest(input.as_bytes());
    format!("imp-{}", &format!("{digest:x}")[..20])
}

/// Collects merge writes and commits whenever the store's batch limit is hit.
struct BatchWriter<'a> {
    store: &'a dyn RemoteStore,
    limit: usize,
    batch: WriteBatch,
    written: usize,
    committed: usize,
}

impl<'a> BatchWriter<'a> {
    fn new(store: &'a dyn RemoteStore) -> Self {
        Self {
            store,
            limit: store.batch_limit().max(1),
            batch: WriteBatch::new(),
            written: 0,
            committed: 0,
        }
    }

    async fn set(&mut self, address: crate::address::DocumentAddress, value: Value) -> Result<()> {
        self.batch.set(address, value, SetOptions::merge());
        if self.batch.len() >= self.limit {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let len = batch.len();
        self.store.commit(batch).await?;
        self.written += len;
        self.committed += 1;
        tracing::debug!("Committed import batch of {} writes", len);
        Ok(())
    }
}

pub struct ImportPipeline {
    store: Arc<dyn RemoteStore>,
    repo: Arc<dyn BackupRepository>,
    branch: Option<String>,
}

impl ImportPipeline {
    pub fn new(store: Arc<dyn RemoteStore>, repo: Arc<dyn BackupRepository>, branch: Option<String>) -> Self {
        Self { store, repo, branch }
    }

    /// Read every backup file on the branch and merge it into the store.
    ///
    /// Journal answers and log entries from all daily files are gathered
    /// first and written once each at the end. Batches already committed
    /// stay committed if a later one fails.
    pub async fn run(&self, identity: Option<&Identity>) -> Result<ImportReport> {
        let identity = require(identity)?;
        let mut report = ImportReport::default();

        let Some(info) = self.repo.repository().await? else {
            return Err(SyncError::Repository("backup repository not found".to_string()));
        };
        let branch = self.branch.clone().unwrap_or(info.default_branch);
        let Some(head) = self.repo.get_ref(&branch).await? else {
            tracing::info!("Backup branch {} has no commits; nothing to import", branch);
            return Ok(report);
        };
        let tree = self.repo.commit_tree(&head).await?;
        let items = self.repo.list_tree(&tree).await?;

        let tasks = resolve_collection(identity, TASKS)?;
        let notes = resolve_collection(identity, DAILY_NOTES)?;
        let monthly = resolve_collection(identity, MONTHLY_PLANS)?;
        let yearly = resolve_collection(identity, YEARLY_PLANS)?;

        let mut writer = BatchWriter::new(self.store.as_ref());
        let mut journal = JournalAnswers::new();
        let mut log = LogEntries::new();

        for item in items.iter().filter(|item| item.path.ends_with(".md")) {
            let Some(kind) = classify(&item.path) else {
                tracing::debug!("Skipping unrecognized backup file {}", item.path);
                report.files_skipped += 1;
                continue;
            };
            let text = self.repo.read_blob(&item.sha).await?;

            let parsed = match kind {
                BackupFile::Daily(date) => match parse_daily(date, &text) {
                    Some(page) => {
                        let day = format_date(date);
                        let mut seen: HashMap<(String, String), usize> = HashMap::new();
                        for task in page.tasks {
                            let count = seen.entry((task.priority.clone(), task.name.clone())).or_default();
                            let id = imported_task_id(&day, &task.priority, &task.name, *count);
                            *count += 1;
                            writer.set(tasks.document(&id)?, to_value(&task)?).await?;
                        }
                        if let Some(note) = page.note {
                            writer.set(notes.document(&day)?, to_value(&note)?).await?;
                        }
                        if !page.journal.is_empty() {
                            journal.entry(day.clone()).or_default().extend(page.journal);
                        }
                        if let Some(entry) = page.log {
                            log.insert(day, entry);
                        }
                        true
                    }
                    None => false,
                },
                BackupFile::Monthly(month) => match parse_period(&text) {
                    Some(plan) => {
                        writer.set(monthly.document(&month.id)?, to_value(&plan)?).await?;
                        true
                    }
                    None => false,
                },
                BackupFile::Yearly(year) => match parse_period(&text) {
                    Some(plan) => {
                        writer.set(yearly.document(&year.to_string())?, to_value(&plan)?).await?;
                        true
                    }
                    None => false,
                },
            };

            if parsed {
                report.files_parsed += 1;
            } else {
                tracing::warn!("Could not parse backup file {}; skipping", item.path);
                report.files_skipped += 1;
            }
        }

        if !journal.is_empty() {
            writer
                .set(resolve_document(identity, JOURNAL_ANSWERS)?, to_value(&journal)?)
                .await?;
        }
        if !log.is_empty() {
            writer.set(resolve_document(identity, JOURNAL_LOG)?, to_value(&log)?).await?;
        }
        writer.flush().await?;

        report.operations_written = writer.written;
        report.batches_committed = writer.committed;
        tracing::info!(
            "Imported {} files ({} skipped) in {} writes over {} batches",
            report.files_parsed,
            report.files_skipped,
            report.operations_written,
            report.batches_committed
        );
        Ok(report)
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| SyncError::Repository(format!("encoding import record: {e}")))
}
