use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Periodic,
    Specific,
    OpenEnded,
}

impl TaskCategory {
    /// Fixed precedence: a frequency makes a task periodic even when it also has a due date.
    pub fn classify(frequency: Option<Frequency>, due_date: Option<NaiveDate>) -> Self {
        match (frequency, due_date) {
            (Some(_), _) => Self::Periodic,
            (None, Some(_)) => Self::Specific,
            (None, None) => Self::OpenEnded,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Periodic => "periodic",
            Self::Specific => "specific",
            Self::OpenEnded => "open_ended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "periodic" => Some(Self::Periodic),
            "specific" => Some(Self::Specific),
            "open_ended" | "open-ended" => Some(Self::OpenEnded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    #[default]
    Any,
    OnSite,
    Remote,
}

impl TaskMode {
    pub fn is_compatible_with(self, work_mode: WorkMode) -> bool {
        match (self, work_mode) {
            (_, WorkMode::Off) => false,
            (Self::Any, _) => true,
            (Self::OnSite, WorkMode::OnSite) | (Self::Remote, WorkMode::Remote) => true,
            _ => false,
        }
    }

    /// Workdays have no `any` mode, so an unconstrained task maps to on-site.
    pub fn preferred_work_mode(self) -> WorkMode {
        match self {
            Self::Any | Self::OnSite => WorkMode::OnSite,
            Self::Remote => WorkMode::Remote,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::OnSite => "on_site",
            Self::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "any" => Some(Self::Any),
            "on_site" | "onsite" => Some(Self::OnSite),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    OnSite,
    Remote,
    Off,
}

impl WorkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnSite => "on_site",
            Self::Remote => "remote",
            Self::Off => "off",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on_site" | "onsite" => Some(Self::OnSite),
            "remote" => Some(Self::Remote),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub frequency: Option<Frequency>,
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub mode: TaskMode,
    pub display_order: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn category(&self) -> TaskCategory {
        TaskCategory::classify(self.frequency, self.due_date)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "task.id")?;
        validate_non_empty(&self.title, "task.title")?;
        if let Some(order) = self.display_order {
            if order < 0 {
                return Err("task.display_order must be >= 0".to_string());
            }
        }
        Ok(())
    }
}

/// Orders tasks by display order ascending with unordered tasks last,
/// then by creation time and id so the result is deterministic.
pub fn sort_by_display_order(tasks: &mut [Task]) {
    tasks.sort_by(|left, right| {
        compare_display_order(left.display_order, right.display_order)
            .then_with(|| left.created_at.cmp(&right.created_at))
            .then_with(|| left.id.cmp(&right.id))
    });
}

fn compare_display_order(left: Option<i64>, right: Option<i64>) -> Ordering {
    match (left, right) {
        (Some(left), Some(right)) => left.cmp(&right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workday {
    pub user_id: String,
    pub date: NaiveDate,
    pub mode: WorkMode,
}

impl Workday {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.user_id, "workday.user_id")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkdayChange {
    pub date: NaiveDate,
    pub mode: WorkMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModeConflict {
    pub date: NaiveDate,
    pub task_id: String,
    pub task_mode: TaskMode,
    pub work_mode: WorkMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisplayOrderAssignment {
    pub id: String,
    pub display_order: i64,
}

/// Computed work mode for days without an explicit workday row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkdayCalendar {
    pub weekday_modes: HashMap<Weekday, WorkMode>,
    pub holidays: BTreeSet<NaiveDate>,
}

impl Default for WorkdayCalendar {
    fn default() -> Self {
        Self {
            weekday_modes: HashMap::from([
                (Weekday::Mon, WorkMode::OnSite),
                (Weekday::Tue, WorkMode::OnSite),
                (Weekday::Wed, WorkMode::OnSite),
                (Weekday::Thu, WorkMode::OnSite),
                (Weekday::Fri, WorkMode::OnSite),
                (Weekday::Sat, WorkMode::Off),
                (Weekday::Sun, WorkMode::Off),
            ]),
            holidays: BTreeSet::new(),
        }
    }
}

impl WorkdayCalendar {
    pub fn default_mode(&self, date: NaiveDate) -> WorkMode {
        if self.holidays.contains(&date) {
            return WorkMode::Off;
        }
        self.weekday_modes
            .get(&date.weekday())
            .copied()
            .unwrap_or(WorkMode::Off)
    }
}

pub fn parse_weekday(value: &str) -> Option<Weekday> {
    match value.trim().to_ascii_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

pub fn parse_date(value: &str, field_name: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| format!("{field_name} must be YYYY-MM-DD"))
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
