//! On-disk schema for task and dependency files.
//!
//! Every task lives in its own flat JSON file at `tasks/{id}.json`, and every
//! dependency edge in its own file at `deps/{from}--{type}--{to}.json`. The
//! records are deliberately flat (no nested structures) so that the version
//! control layer can merge concurrent edits with last-writer-wins per file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, Result};

/// Separator between the three components of a dependency filename.
pub const DEP_SEPARATOR: &str = "--";

/// Longest accepted task title, in characters.
pub const MAX_TITLE_LEN: usize = 500;

/// Longest accepted dependency type, in characters.
const MAX_DEP_KIND_LEN: usize = 50;

/// A task stored as an individual JSON file in `tasks/{id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,

    pub title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Task kind: bug, feature, task, epic, chore.
    #[serde(rename = "type")]
    pub kind: String,

    /// Workflow status: open, in_progress, blocked, closed, ...
    /// Only "closed" removes a task's edges from the blocked closure.
    pub status: String,

    /// Priority 0-4 (0 = most urgent).
    pub priority: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,

    // A literal `null` written by an older serializer reads back as no tags.
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,

    /// A future `defer_until` hides the task from ready work by default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defer_until: Option<DateTime<Utc>>,
}

fn null_as_empty<'de, D>(de: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<Vec<String>> = Option::deserialize(de)?;
    Ok(opt.unwrap_or_default())
}

impl TaskRecord {
    /// Checks that all required fields hold valid values.
    pub fn validate(&self) -> Result<()> {
        // Presence first, bounds second.
        for (field, value) in [
            ("id", &self.id),
            ("title", &self.title),
            ("type", &self.kind),
            ("status", &self.status),
        ] {
            non_empty(field, value)?;
        }

        let title_len = self.title.chars().count();
        if title_len > MAX_TITLE_LEN {
            return Err(Error::Validation(format!(
                "title is {} characters, max is {}",
                title_len, MAX_TITLE_LEN
            )));
        }

        if !(0..=4).contains(&self.priority) {
            return Err(Error::Validation(format!(
                "priority {} outside 0..=4",
                self.priority
            )));
        }

        Ok(())
    }

    /// Returns true if the task no longer participates in the blocked closure.
    pub fn is_closed(&self) -> bool {
        self.status == "closed"
    }

    /// Canonical filename for this task: `{id}.json`.
    pub fn filename(&self) -> String {
        format!("{}.json", self.id)
    }

    /// Advances `updated_at` to now; callers must do this on every mutation
    /// so that last-writer-wins stays well ordered.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A single dependency edge stored in `deps/{from}--{type}--{to}.json`.
///
/// `from` is the blocker (or parent, or source); `to` is the blocked task.
/// Only edges of type `blocks` participate in the blocked closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepRecord {
    pub from: String,
    pub to: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub created_at: DateTime<Utc>,
}

impl DepRecord {
    /// Checks that the edge triple is fully populated.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("from", &self.from), ("to", &self.to), ("type", &self.kind)] {
            non_empty(field, value)?;
        }

        let kind_len = self.kind.chars().count();
        if kind_len > MAX_DEP_KIND_LEN {
            return Err(Error::Validation(format!(
                "type is {} characters, max is {}",
                kind_len, MAX_DEP_KIND_LEN
            )));
        }

        Ok(())
    }

    /// Returns true if this edge participates in the blocked closure.
    pub fn is_blocking(&self) -> bool {
        self.kind == "blocks"
    }

    /// Canonical filename for this edge: `{from}--{type}--{to}.json`.
    pub fn filename(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}.json",
            self.from,
            self.kind,
            self.to,
            sep = DEP_SEPARATOR
        )
    }
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Recovers a task id from its filename by stripping the `.json` suffix.
pub fn task_id_from_filename(filename: &str) -> Result<String> {
    let id = filename
        .strip_suffix(".json")
        .ok_or_else(|| Error::Parse(format!("{} is not a .json filename", filename)))?;

    if id.is_empty() {
        return Err(Error::Parse(format!("no task id in filename {}", filename)));
    }

    Ok(id.to_string())
}

/// Parses a dependency filename into its `(from, type, to)` components.
///
/// Exactly three non-empty components must result from splitting on `--`.
pub fn parse_dep_filename(filename: &str) -> Result<(String, String, String)> {
    let name = filename
        .strip_suffix(".json")
        .ok_or_else(|| Error::Parse(format!("{} is not a .json filename", filename)))?;

    match name
        .split(DEP_SEPARATOR)
        .collect::<Vec<&str>>()
        .as_slice()
    {
        [from, kind, to] if !from.is_empty() && !kind.is_empty() && !to.is_empty() => {
            Ok((from.to_string(), kind.to_string(), to.to_string()))
        }
        _ => Err(Error::Parse(format!(
            "{} does not name an edge (want {{from}}--{{type}}--{{to}}.json)",
            filename
        ))),
    }
}
