// Copyright (c) 2025 sbksba
//
// This software is licensed under the terms of the MIT License.
// See the LICENSE file in the project root for the full license text.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, Months, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marker rendered in front of the name of an overdue task.
/// It is never stored: the database keeps the state in the `status` column.
pub const OVERDUE_MARKER: &str = "❌ ";

/// Validation errors for task data coming from users or from storage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("invalid time '{0}', expected HH:MM (24-hour)")]
    InvalidTime(String),

    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("unknown recurrence '{0}'")]
    UnknownRecurrence(String),

    #[error("unknown task status '{0}'")]
    UnknownStatus(String),

    #[error("field '{0}' cannot be updated")]
    UnknownField(String),

    #[error("task name cannot be empty")]
    EmptyName,
}

/// How often a task regenerates a successor once its occurrence passes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    #[default]
    Once,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Recurrence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recurrence::Once => "once",
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
            Recurrence::Yearly => "yearly",
        }
    }

    /// Date of the occurrence following `date`, or `None` for one-time tasks.
    ///
    /// Month and year steps are calendar steps clamped to the end of the
    /// target month: Jan 31 + 1 month is the last day of February, and
    /// Feb 29 + 1 year is Feb 28.
    pub fn next_date(&self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            Recurrence::Once => None,
            Recurrence::Daily => date.checked_add_days(Days::new(1)),
            Recurrence::Weekly => date.checked_add_days(Days::new(7)),
            Recurrence::Monthly => date.checked_add_months(Months::new(1)),
            Recurrence::Yearly => date.checked_add_months(Months::new(12)),
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recurrence {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Recurrence::Once),
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly),
            "monthly" => Ok(Recurrence::Monthly),
            "yearly" => Ok(Recurrence::Yearly),
            other => Err(TaskError::UnknownRecurrence(other.to_string())),
        }
    }
}

/// Scheduling state of a task.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Overdue,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Overdue => "overdue",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "overdue" => Ok(TaskStatus::Overdue),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

/// Parses a time of day written as `H:MM` or `HH:MM` (24-hour clock).
///
/// The hour takes one or two digits (0-23), the minute exactly two (00-59).
/// Seconds are not accepted.
pub fn parse_task_time(input: &str) -> Result<NaiveTime, TaskError> {
    let invalid = || TaskError::InvalidTime(input.to_string());

    let (hour, minute) = input.split_once(':').ok_or_else(invalid)?;
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());

    if hour.is_empty() || hour.len() > 2 || !all_digits(hour) {
        return Err(invalid());
    }
    if minute.len() != 2 || !all_digits(minute) {
        return Err(invalid());
    }

    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }

    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

/// Canonical `HH:MM` form of a time of day.
pub fn format_task_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

/// Parses a calendar date in `YYYY-MM-DD` form.
pub fn parse_task_date(input: &str) -> Result<NaiveDate, TaskError> {
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| TaskError::InvalidDate(input.to_string()))
}

/// Strips surrounding whitespace and any leading overdue marker left over
/// from older data, so the same task always compares equal by name.
pub fn normalize_name(name: &str) -> String {
    let mut name = name.trim();
    while let Some(rest) = name.strip_prefix('❌') {
        name = rest.trim_start();
    }
    name.trim_end().to_string()
}

/// Serde adapter writing `NaiveTime` as `HH:MM`.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_task_time(*time))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_task_time(&raw).map_err(serde::de::Error::custom)
    }
}

/// A scheduled reminder.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    pub owner: i64,
    pub name: String,
    // Naive on purpose: the service works in a single local timezone.
    pub scheduled_date: NaiveDate,
    #[serde(with = "hhmm")]
    pub scheduled_time: NaiveTime,
    pub recurrence: Recurrence,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn scheduled_at(&self) -> NaiveDateTime {
        self.scheduled_date.and_time(self.scheduled_time)
    }

    /// Whole seconds from `now` until the scheduled instant, rounded down, so
    /// the value turns negative as soon as the instant has passed.
    pub fn seconds_until(&self, now: NaiveDateTime) -> i64 {
        (self.scheduled_at() - now).num_milliseconds().div_euclid(1000)
    }

    pub fn is_overdue(&self) -> bool {
        self.status == TaskStatus::Overdue
    }

    /// Name as shown to users, with the overdue marker when applicable.
    pub fn display_name(&self) -> String {
        match self.status {
            TaskStatus::Overdue => format!("{OVERDUE_MARKER}{}", self.name),
            TaskStatus::Pending => self.name.clone(),
        }
    }

    pub fn time_label(&self) -> String {
        format_task_time(self.scheduled_time)
    }
}

/// Raw `tasks` row as stored in SQLite.
///
/// Dates, times and enums are kept as text so that a single malformed row
/// can be reported and skipped instead of failing a whole query.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    #[sqlx(rename = "id")]
    pub id: i64,

    #[sqlx(rename = "owner")]
    pub owner: i64,

    #[sqlx(rename = "name")]
    pub name: String,

    #[sqlx(rename = "task_date")]
    pub task_date: String,

    #[sqlx(rename = "task_time")]
    pub task_time: String,

    #[sqlx(rename = "recurrence")]
    pub recurrence: String,

    #[sqlx(rename = "status")]
    pub status: String,

    #[sqlx(rename = "created_at")]
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            owner: row.owner,
            name: normalize_name(&row.name),
            scheduled_date: parse_task_date(&row.task_date)?,
            scheduled_time: parse_task_time(&row.task_time)?,
            recurrence: row.recurrence.parse()?,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

/// Columns that may be changed through a partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskField {
    Name,
    Date,
    Time,
    Recurrence,
    Status,
}

impl TaskField {
    pub fn column(&self) -> &'static str {
        match self {
            TaskField::Name => "name",
            TaskField::Date => "task_date",
            TaskField::Time => "task_time",
            TaskField::Recurrence => "recurrence",
            TaskField::Status => "status",
        }
    }

    /// Checks `value` for this field and returns the canonical text to store.
    pub fn canonicalize(&self, value: &str) -> Result<String, TaskError> {
        match self {
            TaskField::Name => {
                let name = normalize_name(value);
                if name.is_empty() {
                    return Err(TaskError::EmptyName);
                }
                Ok(name)
            }
            TaskField::Date => parse_task_date(value).map(|d| d.to_string()),
            TaskField::Time => parse_task_time(value).map(format_task_time),
            TaskField::Recurrence => value.parse::<Recurrence>().map(|r| r.as_str().to_string()),
            TaskField::Status => value.parse::<TaskStatus>().map(|s| s.as_str().to_string()),
        }
    }
}

impl FromStr for TaskField {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(TaskField::Name),
            "date" => Ok(TaskField::Date),
            "time" => Ok(TaskField::Time),
            "recurrence" => Ok(TaskField::Recurrence),
            "status" => Ok(TaskField::Status),
            other => Err(TaskError::UnknownField(other.to_string())),
        }
    }
}

/// Everything needed to insert a task; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub owner: i64,
    pub name: String,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub recurrence: Recurrence,
}

/// Structure used to receive task creation data from the API.
/// `date` defaults to today and `recurrence` to `once` on the server side.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateTaskPayload {
    pub name: String,
    pub date: Option<NaiveDate>,
    pub time: String,
    pub recurrence: Option<Recurrence>,
}

/// Partial edit of a task. Absent fields are left untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UpdateTaskPayload {
    pub name: Option<String>,
    pub date: Option<NaiveDate>,
    pub time: Option<String>,
    pub recurrence: Option<Recurrence>,
}

/// Task as returned by the API, with the overdue marker rendered.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub display_name: String,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        let display_name = task.display_name();
        Self { task, display_name }
    }
}
