//! The backup text format (version 1).
//!
//! Every section starts with one of a fixed set of `## ` headings and runs
//! until the next known heading or the end of the file. Unknown headings are
//! treated as body text of the section they appear in; a file with no known
//! headings parses to `None`.
//!
//! A `#` that starts a body line, or the last word of a checklist item, is
//! markup. Text that would start that way is written with one extra leading
//! backslash and read back without it.
//!
//! ~~~text
//! # 2025-01-01
//! <!-- planner-sync format v1 -->
//!
//! ## Tasks
//!
//! ### P1
//! - [ ] Write report #work
//!
//! ## Notes
//!
//! free text
//!
//! ## Journal
//!
//! ### What went well?
//!
//! answer
//!
//! ## Log
//!
//! ```json
//! { ... }
//! ```
//! ~~~

use crate::model::{format_date, parse_date, DailyNote, Goal, MonthId, PeriodPlan, PeriodPlanUpdate, Task};
use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::LazyLock;

pub const FORMAT_VERSION: u32 = 1;
const VERSION_MARKER: &str = "<!-- planner-sync format v1 -->";

const TASKS_HEADING: &str = "## Tasks";
const NOTES_HEADING: &str = "## Notes";
const JOURNAL_HEADING: &str = "## Journal";
const LOG_HEADING: &str = "## Log";
const FOCUS_HEADING: &str = "## Focus";
const GOALS_HEADING: &str = "## Goals";

const DAILY_HEADINGS: &[&str] = &[TASKS_HEADING, NOTES_HEADING, JOURNAL_HEADING, LOG_HEADING];
const PERIOD_HEADINGS: &[&str] = &[FOCUS_HEADING, GOALS_HEADING, NOTES_HEADING];

const SUBHEADING_PREFIX: &str = "### ";
const FENCE: &str = "```";

static CHECKLIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*] \[([ xX])\]\s+(.*?)(?:\s+#([^\s#]+))?\s*$").unwrap()
});

static YEARLY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-Overview$").unwrap());

static MONTHLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4}-\d{1,2})-Overview$").unwrap());

static DAILY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

/// One file of an export: repository-relative path and its text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportFile {
    pub path: String,
    pub content: String,
}

// ---------------------------------------------------------------------------
// File naming
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupFile {
    Daily(NaiveDate),
    Monthly(MonthId),
    Yearly(i32),
}

pub fn daily_path(date: NaiveDate) -> String {
    format!("{}/{}.md", date.format("%Y/%m"), format_date(date))
}

/// The folder is always zero-padded; the file name carries the document id
/// as stored.
pub fn monthly_path(month: &MonthId) -> String {
    format!("{:04}/{:02}/{}-Overview.md", month.key.year, month.key.month, month.id)
}

pub fn yearly_path(year: i32) -> String {
    format!("{year:04}/{year:04}-Overview.md")
}

/// Dispatch on the file name alone; folders are not trusted.
pub fn classify(path: &str) -> Option<BackupFile> {
    let name = path.rsplit('/').next()?;
    let stem = name.strip_suffix(".md")?;

    if let Some(caps) = YEARLY_RE.captures(stem) {
        return caps[1].parse().ok().map(BackupFile::Yearly);
    }
    if let Some(caps) = MONTHLY_RE.captures(stem) {
        return MonthId::parse(&caps[1]).map(BackupFile::Monthly);
    }
    if DAILY_RE.is_match(stem) {
        return parse_date(stem).map(BackupFile::Daily);
    }
    None
}

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

fn escape_hash(word: &str) -> Cow<'_, str> {
    if word.trim_start_matches('\\').starts_with('#') {
        Cow::Owned(format!("\\{word}"))
    } else {
        Cow::Borrowed(word)
    }
}

fn unescape_hash(word: &str) -> &str {
    match word.strip_prefix('\\') {
        Some(rest) if rest.trim_start_matches('\\').starts_with('#') => rest,
        _ => word,
    }
}

/// Byte offset of the last whitespace-separated word.
fn last_word_start(text: &str) -> usize {
    text.char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map_or(0, |(i, c)| i + c.len_utf8())
}

fn escape_body(text: &str) -> String {
    text.trim().lines().map(escape_hash).collect::<Vec<_>>().join("\n")
}

// ---------------------------------------------------------------------------
// Checklists
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecklistItem {
    pub completed: bool,
    pub text: String,
    pub tag: Option<String>,
}

impl ChecklistItem {
    pub fn parse(line: &str) -> Option<Self> {
        let caps = CHECKLIST_RE.captures(line)?;
        let text = caps[2].trim();
        if text.is_empty() {
            return None;
        }
        let (head, last) = text.split_at(last_word_start(text));
        let text = format!("{head}{}", unescape_hash(last));
        Some(Self {
            completed: &caps[1] != " ",
            text,
            tag: caps.get(3).map(|m| m.as_str().to_string()),
        })
    }

    pub fn render(&self) -> String {
        let mark = if self.completed { 'x' } else { ' ' };
        let (head, last) = self.text.split_at(last_word_start(&self.text));
        let text = format!("{head}{}", escape_hash(last));
        match &self.tag {
            Some(tag) => format!("- [{mark}] {text} #{tag}"),
            None => format!("- [{mark}] {text}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Split `text` at the known headings. Lines before the first one (title,
/// version marker) are dropped.
fn split_sections<'a>(text: &'a str, headings: &[&str]) -> Vec<(&'a str, Vec<&'a str>)> {
    let mut sections = Vec::new();
    let mut current: Option<(&'a str, Vec<&'a str>)> = None;
    for line in text.lines() {
        let trimmed = line.trim_end();
        if headings.iter().any(|h| *h == trimmed) {
            sections.extend(current.take());
            current = Some((trimmed, Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    sections.extend(current);
    sections
}

fn block(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|line| unescape_hash(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// `### heading` entries with their bodies.
fn subsections(lines: &[&str]) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    for &line in lines {
        if let Some(title) = line.strip_prefix(SUBHEADING_PREFIX) {
            if let Some((title, body)) = current.take() {
                entries.push((title, block(&body)));
            }
            current = Some((title.trim().to_string(), Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((title, body)) = current {
        entries.push((title, block(&body)));
    }
    entries
}

fn fenced_json(lines: &[&str]) -> Option<Value> {
    let start = lines.iter().position(|l| l.trim_start().starts_with(FENCE))?;
    let len = lines[start + 1..].iter().position(|l| l.trim() == FENCE)?;
    let body = lines[start + 1..start + 1 + len].join("\n");
    match serde_json::from_str(&body) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Dropping unreadable log block: {}", e);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Daily pages
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DailyPage {
    pub tasks: Vec<Task>,
    pub note: Option<DailyNote>,
    /// prompt -> answer
    pub journal: BTreeMap<String, String>,
    pub log: Option<Value>,
}

impl DailyPage {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.note.is_none() && self.journal.is_empty() && self.log.is_none()
    }
}

pub fn render_daily(date: NaiveDate, page: &DailyPage) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}", format_date(date));
    let _ = writeln!(out, "{VERSION_MARKER}");

    if !page.tasks.is_empty() {
        let _ = writeln!(out, "\n{TASKS_HEADING}\n");
        let mut tiers: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
        for task in &page.tasks {
            tiers.entry(task.priority.trim()).or_default().push(task);
        }
        for (priority, tasks) in tiers {
            // Tasks without a priority sit above the first tier.
            if !priority.is_empty() {
                let _ = writeln!(out, "{SUBHEADING_PREFIX}{priority}");
            }
            for task in tasks {
                let item = ChecklistItem {
                    completed: task.completed,
                    text: task.name.clone(),
                    tag: task.tag.clone(),
                };
                let _ = writeln!(out, "{}", item.render());
            }
        }
    }

    if let Some(note) = page.note.as_ref().filter(|n| !n.content.trim().is_empty()) {
        let _ = writeln!(out, "\n{NOTES_HEADING}\n\n{}", escape_body(&note.content));
    }

    if !page.journal.is_empty() {
        let _ = writeln!(out, "\n{JOURNAL_HEADING}");
        for (prompt, answer) in &page.journal {
            let _ = writeln!(out, "\n{SUBHEADING_PREFIX}{prompt}\n\n{}", escape_body(answer));
        }
    }

    if let Some(log) = &page.log {
        let rendered = serde_json::to_string_pretty(log).unwrap_or_else(|_| log.to_string());
        let _ = writeln!(out, "\n{LOG_HEADING}\n\n{FENCE}json\n{rendered}\n{FENCE}");
    }
    out
}

pub fn parse_daily(date: NaiveDate, text: &str) -> Option<DailyPage> {
    let sections = split_sections(text, DAILY_HEADINGS);
    if sections.is_empty() {
        return None;
    }

    let day = format_date(date);
    let mut page = DailyPage::default();
    for (heading, lines) in sections {
        match heading {
            TASKS_HEADING => {
                let mut priority = String::new();
                for line in &lines {
                    if let Some(tier) = line.strip_prefix(SUBHEADING_PREFIX) {
                        priority = tier.trim().to_string();
                    } else if let Some(item) = ChecklistItem::parse(line) {
                        page.tasks.push(Task {
                            name: item.text,
                            priority: priority.clone(),
                            completed: item.completed,
                            date: Some(day.clone()),
                            tag: item.tag,
                        });
                    }
                }
            }
            NOTES_HEADING => {
                let content = block(&lines);
                if !content.is_empty() {
                    page.note = Some(DailyNote { content });
                }
            }
            JOURNAL_HEADING => page.journal.extend(subsections(&lines)),
            LOG_HEADING => page.log = fenced_json(&lines),
            _ => {}
        }
    }
    Some(page)
}

// ---------------------------------------------------------------------------
// Monthly and yearly overviews
// ---------------------------------------------------------------------------

pub fn monthly_title(month: &MonthId) -> String {
    format!("{} Overview", month.key)
}

pub fn yearly_title(year: i32) -> String {
    format!("{year:04} Overview")
}

pub fn render_period(title: &str, plan: &PeriodPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {title}");
    let _ = writeln!(out, "{VERSION_MARKER}");
    if !plan.focus.trim().is_empty() {
        let _ = writeln!(out, "\n{FOCUS_HEADING}\n\n{}", escape_body(&plan.focus));
    }
    if !plan.goals.is_empty() {
        let _ = writeln!(out, "\n{GOALS_HEADING}\n");
        for goal in &plan.goals {
            let item = ChecklistItem {
                completed: goal.completed,
                text: goal.text.trim().to_string(),
                tag: None,
            };
            let _ = writeln!(out, "{}", item.render());
        }
    }
    if !plan.notes.trim().is_empty() {
        let _ = writeln!(out, "\n{NOTES_HEADING}\n\n{}", escape_body(&plan.notes));
    }
    out
}

/// Only the sections present in the file are set on the result.
pub fn parse_period(text: &str) -> Option<PeriodPlanUpdate> {
    let sections = split_sections(text, PERIOD_HEADINGS);
    if sections.is_empty() {
        return None;
    }
    let mut plan = PeriodPlanUpdate::default();
    for (heading, lines) in sections {
        match heading {
            FOCUS_HEADING => plan.focus = Some(block(&lines)),
            GOALS_HEADING => {
                let goals = lines
                    .iter()
                    .filter_map(|line| ChecklistItem::parse(line))
                    .map(|item| Goal {
                        // Goals carry no tags; a trailing `#word` is text.
                        text: match item.tag {
                            Some(tag) => format!("{} #{tag}", item.text),
                            None => item.text,
                        },
                        completed: item.completed,
                    })
                    .collect();
                plan.goals = Some(goals);
            }
            NOTES_HEADING => plan.notes = Some(block(&lines)),
            _ => {}
        }
    }
    Some(plan)
}
