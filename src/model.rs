//! Domain entities for the two trees
//!
//! `depth` and `parent_id` on [`Workspace`] and [`Todo`] are view fields. They
//! are filled in from the closure table by every query and are never written
//! back; the closure table is the only source of truth for topology.

use crate::schema::{todos, workspaces};
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// Name prefix reserved for system workspaces
pub const SYSTEM_PREFIX: char = '_';
pub const ARCHIVE_WORKSPACE: &str = "_archive";
pub const ARCHIVE_POSITION: i32 = 999_999;

pub const URGENCY_LOW: i32 = 1;
pub const URGENCY_MEDIUM: i32 = 2;
pub const URGENCY_HIGH: i32 = 3;
pub const URGENCY_CRITICAL: i32 = 4;

/// Which tree a node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeKind {
    Workspace,
    Todo,
}

impl TreeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeKind::Workspace => "workspace",
            TreeKind::Todo => "todo",
        }
    }

    pub fn entity_table(&self) -> &'static str {
        match self {
            TreeKind::Workspace => "workspaces",
            TreeKind::Todo => "todos",
        }
    }

    pub fn closure_table(&self) -> &'static str {
        match self {
            TreeKind::Workspace => "workspace_closure",
            TreeKind::Todo => "todo_closure",
        }
    }

    pub fn all() -> [TreeKind; 2] {
        [TreeKind::Workspace, TreeKind::Todo]
    }
}

impl std::fmt::Display for TreeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TreeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workspace" => Ok(TreeKind::Workspace),
            "todo" => Ok(TreeKind::Todo),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Current time as a fixed-width RFC3339 UTC string.
///
/// Fixed width (microseconds, `Z` suffix) keeps lexical order equal to
/// chronological order, which the ordering and retention queries rely on.
pub fn now() -> String {
    format_ts(Utc::now())
}

pub fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// ============================================================================
// Workspace
// ============================================================================

#[derive(QueryableByName, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = workspaces)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub position: i32,
    pub is_expanded: bool,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    pub depth: i32,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Text>)]
    pub parent_id: Option<String>,
}

impl Workspace {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// System workspaces (e.g. `_archive`) are managed by the engine
    pub fn is_system(&self) -> bool {
        self.name.starts_with(SYSTEM_PREFIX)
    }
}

/// Attributes for a new workspace
#[derive(Debug, Clone, Default)]
pub struct NewWorkspace {
    pub name: String,
    pub position: i32,
    pub is_expanded: bool,
    pub parent_id: Option<String>,
}

impl NewWorkspace {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_expanded: true,
            ..Default::default()
        }
    }

    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn at(mut self, position: i32) -> Self {
        self.position = position;
        self
    }
}

// ============================================================================
// Todo
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoStatus {
    Pending,
    Completed,
}

impl TodoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoStatus::Pending => "pending",
            TodoStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "completed" {
            TodoStatus::Completed
        } else {
            TodoStatus::Pending
        }
    }
}

#[derive(QueryableByName, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = todos)]
pub struct Todo {
    pub id: String,
    pub workspace_id: String,
    pub description: String,
    pub position: i32,
    pub status: String,
    pub urgency: i32,
    pub due_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub deleted_at: Option<String>,
    pub is_archived: bool,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    pub depth: i32,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Text>)]
    pub parent_id: Option<String>,
}

impl Todo {
    pub fn status(&self) -> TodoStatus {
        TodoStatus::parse(&self.status)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.status() == TodoStatus::Completed
    }

    pub fn is_pending(&self) -> bool {
        self.status() == TodoStatus::Pending
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        if self.is_completed() {
            return false;
        }
        self.due_date
            .as_deref()
            .and_then(parse_ts)
            .is_some_and(|due| now > due)
    }

    pub fn is_due_today(&self, now: DateTime<Utc>) -> bool {
        self.due_date
            .as_deref()
            .and_then(parse_ts)
            .is_some_and(|due| due.date_naive() == now.date_naive())
    }
}

/// Attributes for a new todo
#[derive(Debug, Clone)]
pub struct NewTodo {
    pub workspace_id: String,
    pub description: String,
    pub position: i32,
    pub urgency: i32,
    pub due_date: Option<String>,
    pub parent_id: Option<String>,
}

impl NewTodo {
    pub fn new(workspace_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            description: description.into(),
            position: 0,
            urgency: URGENCY_MEDIUM,
            due_date: None,
            parent_id: None,
        }
    }

    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn at(mut self, position: i32) -> Self {
        self.position = position;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_todo(status: &str, due: Option<DateTime<Utc>>) -> Todo {
        let ts = now();
        Todo {
            id: "t1".to_string(),
            workspace_id: "w1".to_string(),
            description: "Write tests".to_string(),
            position: 0,
            status: status.to_string(),
            urgency: URGENCY_HIGH,
            due_date: due.map(format_ts),
            created_at: ts.clone(),
            updated_at: ts,
            completed_at: None,
            deleted_at: None,
            is_archived: false,
            depth: 0,
            parent_id: None,
        }
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + Duration::milliseconds(1);
        assert!(format_ts(a) < format_ts(b));
        assert_eq!(parse_ts(&format_ts(a)).map(format_ts), Some(format_ts(a)));
    }

    #[test]
    fn test_overdue_and_due_today() {
        let now = Utc::now();
        let late = make_todo("pending", Some(now - Duration::hours(1)));
        assert!(late.is_overdue(now));

        let done = make_todo("completed", Some(now - Duration::hours(1)));
        assert!(!done.is_overdue(now));

        let today = make_todo("pending", Some(now));
        assert!(today.is_due_today(now));
        assert!(!make_todo("pending", None).is_due_today(now));
    }

    #[test]
    fn test_tree_kind_names() {
        assert_eq!(TreeKind::Workspace.closure_table(), "workspace_closure");
        assert_eq!("todo".parse::<TreeKind>(), Ok(TreeKind::Todo));
        assert!("folder".parse::<TreeKind>().is_err());
    }

    #[test]
    fn test_system_workspace() {
        let ws = Workspace {
            id: "a".into(),
            name: ARCHIVE_WORKSPACE.into(),
            position: ARCHIVE_POSITION,
            is_expanded: false,
            created_at: now(),
            updated_at: now(),
            deleted_at: None,
            depth: 0,
            parent_id: None,
        };
        assert!(ws.is_system());
    }
}
