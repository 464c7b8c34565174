//! Entity kinds synchronized by a [`Session`](crate::Session).
//!
//! Patches overwrite only the fields they carry. Nullable fields use a double
//! option in patches: `None` leaves the field alone, `Some(None)` clears it.

use chrono::{DateTime, NaiveDate, Utc};
use rebound_engine::Payload;
use serde::{Deserialize, Deserializer, Serialize};

/// Entity type names used on the wire.
pub const TASKS: &str = "tasks";
pub const GOALS: &str = "goals";
pub const JOURNAL_ENTRIES: &str = "journal_entries";

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn overwrite<T: Clone>(field: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *field = value.clone();
    }
}

// ============================================================================
// Task
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub goal_id: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    pub user_id: String,
}

impl Task {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            notes: String::new(),
            completed: false,
            goal_id: None,
            due_at: None,
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub goal_id: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub due_at: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Self::default()
        }
    }
}

impl Payload for Task {
    type Patch = TaskPatch;

    fn apply_patch(&mut self, patch: &TaskPatch) {
        overwrite(&mut self.title, &patch.title);
        overwrite(&mut self.notes, &patch.notes);
        overwrite(&mut self.completed, &patch.completed);
        overwrite(&mut self.goal_id, &patch.goal_id);
        overwrite(&mut self.due_at, &patch.due_at);
    }
}

// ============================================================================
// Goal
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
    #[serde(default)]
    pub archived: bool,
    pub user_id: String,
}

impl Goal {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            target_date: None,
            archived: false,
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub target_date: Option<Option<NaiveDate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl Payload for Goal {
    type Patch = GoalPatch;

    fn apply_patch(&mut self, patch: &GoalPatch) {
        overwrite(&mut self.title, &patch.title);
        overwrite(&mut self.description, &patch.description);
        overwrite(&mut self.target_date, &patch.target_date);
        overwrite(&mut self.archived, &patch.archived);
    }
}

// ============================================================================
// Journal entry
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub body: String,
    #[serde(default)]
    pub mood: Option<u8>,
    pub entry_date: NaiveDate,
    pub user_id: String,
}

impl JournalEntry {
    pub fn new(user_id: impl Into<String>, entry_date: NaiveDate, body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            mood: None,
            entry_date,
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalEntryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub mood: Option<Option<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_date: Option<NaiveDate>,
}

impl Payload for JournalEntry {
    type Patch = JournalEntryPatch;

    fn apply_patch(&mut self, patch: &JournalEntryPatch) {
        overwrite(&mut self.body, &patch.body);
        overwrite(&mut self.mood, &patch.mood);
        overwrite(&mut self.entry_date, &patch.entry_date);
    }
}
