//! Planner records and the logical paths they live at.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const TASKS: &str = "tasks";
pub const HABITS: &str = "habits";
pub const DAILY_NOTES: &str = "planner/daily";
pub const MONTHLY_PLANS: &str = "planner/monthly";
pub const YEARLY_PLANS: &str = "planner/yearly";
/// Single multi-date document: date -> prompt -> answer.
pub const JOURNAL_ANSWERS: &str = "journal/answers";
/// Single multi-date document: date -> free-form JSON.
pub const JOURNAL_LOG: &str = "journal/log";
pub const SETTINGS: &str = "config/settings";
pub const TIMER_SETTINGS: &str = "config/timer";
pub const MIGRATION_RECORD: &str = "meta/migration";

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyNote {
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

/// Monthly or yearly plan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodPlan {
    #[serde(default)]
    pub focus: String,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub notes: String,
}

impl PeriodPlan {
    pub fn is_empty(&self) -> bool {
        self.focus.trim().is_empty() && self.goals.is_empty() && self.notes.trim().is_empty()
    }
}

/// The sections of a plan that a backup file actually carried. Serializes
/// only the present fields, so a merge write leaves the others untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PeriodPlanUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goals: Option<Vec<Goal>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PeriodPlanUpdate {
    /// Apply onto `base`, keeping the fields this update does not carry.
    pub fn apply_to(&self, mut base: PeriodPlan) -> PeriodPlan {
        if let Some(focus) = &self.focus {
            base.focus = focus.clone();
        }
        if let Some(goals) = &self.goals {
            base.goals = goals.clone();
        }
        if let Some(notes) = &self.notes {
            base.notes = notes.clone();
        }
        base
    }
}

pub type JournalAnswers = BTreeMap<String, BTreeMap<String, String>>;
pub type LogEntries = BTreeMap<String, Value>;

/// `YYYY-MM`. Parsing also accepts an unpadded month (`2025-5`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn parse(raw: &str) -> Option<Self> {
        let (year, month) = raw.trim().split_once('-')?;
        let year: i32 = year.parse().ok()?;
        let month: u32 = month.parse().ok()?;
        (1..=12).contains(&month).then_some(Self { year, month })
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// A monthly plan's document id together with the month it names. The id
/// keeps its stored spelling (`2025-5` and `2025-05` are different
/// documents); ordering is by month first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthId {
    pub key: MonthKey,
    pub id: String,
}

impl MonthId {
    /// Accepts `YYYY-M` or `YYYY-MM` exactly, without surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        let (year, month) = raw.split_once('-')?;
        let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if year.len() != 4 || !(1..=2).contains(&month.len()) || !digits(year) || !digits(month) {
            return None;
        }
        Some(Self {
            key: MonthKey::parse(raw)?,
            id: raw.to_string(),
        })
    }
}

impl fmt::Display for MonthId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Everything the backup covers, read in one pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlannerState {
    /// (document id, task)
    pub tasks: Vec<(String, Task)>,
    pub daily_notes: BTreeMap<NaiveDate, DailyNote>,
    pub monthly_plans: BTreeMap<MonthId, PeriodPlan>,
    pub yearly_plans: BTreeMap<i32, PeriodPlan>,
    pub journal: JournalAnswers,
    pub log: LogEntries,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn month_key_normalizes_padding() {
        assert_eq!(MonthKey::parse("2025-5").unwrap().to_string(), "2025-05");
        assert_eq!(MonthKey::parse("2025-05"), MonthKey::parse("2025-5"));
        assert!(MonthKey::parse("2025-13").is_none());
        assert!(MonthKey::parse("2025").is_none());
    }

    #[test]
    fn month_id_keeps_its_spelling() {
        let short = MonthId::parse("2025-5").unwrap();
        let padded = MonthId::parse("2025-05").unwrap();
        assert_eq!(short.key, padded.key);
        assert_ne!(short, padded);
        assert_eq!(short.to_string(), "2025-5");
        assert!(MonthId::parse(" 2025-05").is_none());
        assert!(MonthId::parse("2025-005").is_none());
        assert!(MonthId::parse("25-05").is_none());
        assert!(MonthId::parse("2025-0").is_none());
    }

    #[test]
    fn plan_update_serializes_only_present_sections() {
        let update = PeriodPlanUpdate {
            focus: Some("ship".into()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&update).unwrap(), json!({"focus": "ship"}));

        let base = PeriodPlan {
            focus: "old".into(),
            goals: vec![Goal { text: "Run".into(), completed: false }],
            notes: "kept".into(),
        };
        let merged = update.apply_to(base.clone());
        assert_eq!(merged.focus, "ship");
        assert_eq!(merged.goals, base.goals);
        assert_eq!(merged.notes, "kept");
    }

    #[test]
    fn task_tolerates_missing_optional_fields() {
        let task: Task = serde_json::from_value(json!({"name": "X"})).unwrap();
        assert_eq!(task.priority, "");
        assert!(!task.completed);
        assert_eq!(serde_json::to_value(&task).unwrap(), json!({"name": "X", "priority": "", "completed": false}));
    }

    #[test]
    fn empty_plan_detection_ignores_whitespace() {
        let plan = PeriodPlan {
            focus: "  ".into(),
            ..Default::default()
        };
        assert!(plan.is_empty());
    }
}
