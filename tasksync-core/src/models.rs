use crate::errors::{SyncError, SyncResult};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Debug;
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Task,
    Category,
    Invite,
}

/// Domain payload of a locally stored entity.
///
/// The sync core never interprets these fields beyond validation and the
/// archive/closed rule; they are compared and transported as a whole.
pub trait EntityData:
    Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync + 'static
{
    const KIND: EntityKind;

    /// Rejects bad local input before anything touches storage.
    fn validate(&self) -> SyncResult<()>;

    fn normalize(&mut self) {}

    /// Whether an archived entity of this kind is legitimately archived.
    fn is_closed(&self) -> bool {
        true
    }
}

/// A stored entity: the sync metadata plus its domain payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<D> {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
    #[serde(flatten)]
    pub data: D,
}

impl<D: EntityData> Record<D> {
    pub fn kind(&self) -> EntityKind {
        D::KIND
    }

    /// `archived = true` on an entity that is not closed is invalid and is
    /// folded back to `archived = false`.
    pub fn normalize(&mut self) {
        self.data.normalize();
        if self.archived && !self.data.is_closed() {
            self.archived = false;
        }
    }
}

/// Input to `EntityStore::create`.
///
/// `id` and the timestamps are only set when the caller replays an entity that
/// already has an identity (import, sync). Fresh local creates leave them empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft<D> {
    pub id: Option<Uuid>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub data: D,
}

impl<D> Draft<D> {
    pub fn new(data: D) -> Self {
        Self {
            id: None,
            created_at: None,
            updated_at: None,
            archived: false,
            data,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = archived;
        self
    }
}

impl<D> From<Record<D>> for Draft<D> {
    fn from(record: Record<D>) -> Self {
        Self {
            id: Some(record.id),
            created_at: Some(record.created_at),
            updated_at: Some(record.updated_at),
            archived: record.archived,
            data: record.data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RepeatInterval {
    Daily,
    Workdaily,
    Weekly,
    WeeklyCustomDays,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskData {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Number of completions. Repeating tasks count up, others are 0 or 1.
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// `YYYY-MM-DD` or `YYYY-MM-DD HH:mm`
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub repeat_interval: Option<RepeatInterval>,
    #[serde(default)]
    pub repeat_interval_number: u32,
    /// Days of week for `WeeklyCustomDays`, 0 = Sunday.
    #[serde(default)]
    pub repeat_specific_days: Vec<u8>,
    #[serde(default)]
    pub important: bool,
    #[serde(default)]
    pub category_id: Option<Uuid>,
    #[serde(default)]
    pub assigned_user: Option<String>,
    #[serde(default)]
    pub photo_ids: Vec<String>,
}

impl TaskData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn in_category(mut self, category_id: Uuid) -> Self {
        self.category_id = Some(category_id);
        self
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat_interval.is_some() && self.start_date.is_some()
    }

    /// Moves start and due dates forward by one repeat step.
    pub fn advance_schedule(&mut self) {
        let Some(interval) = self.repeat_interval else {
            return;
        };
        let step = self.repeat_interval_number.max(1);
        let days = &self.repeat_specific_days;
        self.start_date = self
            .start_date
            .as_deref()
            .and_then(|d| advance_date(d, interval, step, days));
        self.due_date = self
            .due_date
            .as_deref()
            .and_then(|d| advance_date(d, interval, step, days));
    }
}

impl EntityData for TaskData {
    const KIND: EntityKind = EntityKind::Task;

    fn validate(&self) -> SyncResult<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::validation("task name is required"));
        }
        if let (Some(start), Some(due)) = (&self.start_date, &self.due_date) {
            if start > due {
                return Err(SyncError::validation("start date must be before due date"));
            }
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.description = self.description.trim().to_string();
    }

    fn is_closed(&self) -> bool {
        self.completed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub email: String,
    #[serde(default)]
    pub pending: bool,
}

impl Member {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            pending: false,
        }
    }

    pub fn pending(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            pending: true,
        }
    }
}

/// A task list. Its `users` form the sharing scope of every task in it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CategoryData {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub users: Vec<Member>,
}

impl CategoryData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl EntityData for CategoryData {
    const KIND: EntityKind = EntityKind::Category;

    fn validate(&self) -> SyncResult<()> {
        if !self.is_default && self.name.trim().is_empty() {
            return Err(SyncError::validation("category name is required"));
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
    }
}

pub type Task = Record<TaskData>;
pub type Category = Record<CategoryData>;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

fn advance_date(
    value: &str,
    interval: RepeatInterval,
    step: u32,
    specific_days: &[u8],
) -> Option<String> {
    if let Ok(date_time) = NaiveDateTime::parse_from_str(value, DATE_TIME_FORMAT) {
        let next = advance_day(date_time.date(), interval, step, specific_days)?;
        return Some(next.and_time(date_time.time()).format(DATE_TIME_FORMAT).to_string());
    }
    let date = NaiveDate::parse_from_str(value, DATE_FORMAT).ok()?;
    let next = advance_day(date, interval, step, specific_days)?;
    Some(next.format(DATE_FORMAT).to_string())
}

fn advance_day(
    date: NaiveDate,
    interval: RepeatInterval,
    step: u32,
    specific_days: &[u8],
) -> Option<NaiveDate> {
    match interval {
        RepeatInterval::Daily => date.checked_add_signed(Duration::days(step as i64)),
        RepeatInterval::Workdaily => {
            let days = match date.weekday() {
                Weekday::Fri => 3,
                Weekday::Sat => 2,
                _ => 1,
            };
            date.checked_add_signed(Duration::days(days))
        }
        RepeatInterval::Weekly => date.checked_add_signed(Duration::days(7 * step as i64)),
        RepeatInterval::WeeklyCustomDays => {
            let today = date.weekday().num_days_from_sunday();
            let days = (1..=7u32)
                .find(|offset| specific_days.contains(&(((today + offset) % 7) as u8)))
                .unwrap_or(7);
            date.checked_add_signed(Duration::days(days as i64))
        }
        RepeatInterval::Monthly => date.checked_add_months(Months::new(step)),
        RepeatInterval::Yearly => date.checked_add_months(Months::new(12 * step)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(data: TaskData, archived: bool) -> Task {
        Record {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            archived,
            data,
        }
    }

    #[test]
    fn test_archived_open_task_is_normalized() {
        let mut task = record(TaskData::new("  Water plants "), true);
        task.normalize();
        assert!(!task.archived);
        assert_eq!(task.data.name, "Water plants");

        let mut done = TaskData::new("Done");
        done.completed = 1;
        let mut task = record(done, true);
        task.normalize();
        assert!(task.archived);
    }

    #[test]
    fn test_task_validation() {
        assert!(TaskData::new("   ").validate().is_err());
        assert!(TaskData::new("Buy milk").validate().is_ok());

        let mut task = TaskData::new("Trip");
        task.start_date = Some("2025-03-10".to_string());
        task.due_date = Some("2025-03-01".to_string());
        assert!(matches!(task.validate(), Err(SyncError::Validation(_))));
    }

    #[test]
    fn test_default_category_may_have_blank_name() {
        let mut category = CategoryData::new("");
        assert!(category.validate().is_err());
        category.is_default = true;
        assert!(category.validate().is_ok());
    }

    #[test]
    fn test_record_serializes_flat() {
        let task = record(TaskData::new("Flat"), false);
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["name"], "Flat");
        assert_eq!(value["archived"], false);
        assert!(value.get("data").is_none());

        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_advance_schedule() {
        let mut task = TaskData::new("Standup");
        task.repeat_interval = Some(RepeatInterval::Workdaily);
        // 2025-01-03 is a Friday
        task.start_date = Some("2025-01-03 09:00".to_string());
        task.due_date = Some("2025-01-03".to_string());
        task.advance_schedule();
        assert_eq!(task.start_date.as_deref(), Some("2025-01-06 09:00"));
        assert_eq!(task.due_date.as_deref(), Some("2025-01-06"));

        let mut task = TaskData::new("Rent");
        task.repeat_interval = Some(RepeatInterval::Monthly);
        task.repeat_interval_number = 2;
        task.start_date = Some("2025-01-15".to_string());
        task.advance_schedule();
        assert_eq!(task.start_date.as_deref(), Some("2025-03-15"));

        let mut task = TaskData::new("Gym");
        task.repeat_interval = Some(RepeatInterval::WeeklyCustomDays);
        // Wednesday -> next Monday (1) or Friday (5): Friday comes first
        task.repeat_specific_days = vec![1, 5];
        task.start_date = Some("2025-01-01".to_string());
        task.advance_schedule();
        assert_eq!(task.start_date.as_deref(), Some("2025-01-03"));
    }
}
