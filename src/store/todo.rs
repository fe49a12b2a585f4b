//! Todo tree store
//!
//! Todos carry a workspace membership next to their own parentage. A subtree
//! always lives in one workspace: moves cascade `workspace_id` to every
//! descendant.

use super::{DeletedNode, Relative, TreeStore};
use crate::closure::ClosureTable;
use crate::db::Database;
use crate::error::{Context, Error, Result};
use crate::model::{self, NewTodo, Todo, TodoStatus, TreeKind};
use crate::schema::todos;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel::sqlite::SqliteConnection;
use uuid::Uuid;

const TODO_COLUMNS: &str = "t.id, t.workspace_id, t.description, t.position, t.status, t.urgency, \
    t.due_date, t.created_at, t.updated_at, t.completed_at, t.deleted_at, t.is_archived, \
    COALESCE((SELECT MAX(depth) FROM todo_closure WHERE descendant_id = t.id), 0) AS depth, \
    (SELECT ancestor_id FROM todo_closure WHERE descendant_id = t.id AND depth = 1) AS parent_id";

fn select(tail: &str) -> String {
    format!("SELECT {} FROM todos t {}", TODO_COLUMNS, tail)
}

/// Escape LIKE wildcards so a search matches the literal text
fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

#[derive(Insertable)]
#[diesel(table_name = todos)]
struct NewTodoRow<'a> {
    id: &'a str,
    workspace_id: &'a str,
    description: &'a str,
    position: i32,
    status: &'a str,
    urgency: i32,
    due_date: Option<&'a str>,
    created_at: &'a str,
    updated_at: &'a str,
    completed_at: Option<&'a str>,
    deleted_at: Option<&'a str>,
    is_archived: bool,
}

impl<'a> From<&'a Todo> for NewTodoRow<'a> {
    fn from(t: &'a Todo) -> Self {
        Self {
            id: &t.id,
            workspace_id: &t.workspace_id,
            description: &t.description,
            position: t.position,
            status: &t.status,
            urgency: t.urgency,
            due_date: t.due_date.as_deref(),
            created_at: &t.created_at,
            updated_at: &t.updated_at,
            completed_at: t.completed_at.as_deref(),
            deleted_at: t.deleted_at.as_deref(),
            is_archived: t.is_archived,
        }
    }
}

#[derive(QueryableByName)]
struct RelativeRow {
    #[diesel(embed)]
    node: Todo,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    distance: i32,
}

#[derive(Debug, Clone)]
pub struct TodoStore {
    db: Database,
    closure: ClosureTable,
}

impl TodoStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            closure: ClosureTable::new(TreeKind::Todo),
        }
    }

    pub fn closure(&self) -> ClosureTable {
        self.closure
    }

    pub fn create(&self, new: NewTodo) -> Result<Todo> {
        let id = Uuid::new_v4().to_string();
        let now = model::now();
        let mut conn = self.db.conn()?;
        conn.immediate_transaction::<_, Error, _>(|conn| {
            super::ensure_live(conn, TreeKind::Workspace, &new.workspace_id)?;
            if let Some(parent) = new.parent_id.as_deref() {
                let parent_ws = self.workspace_of(conn, parent)?;
                if parent_ws != new.workspace_id {
                    return Err(Error::invalid(format!(
                        "parent todo {} belongs to another workspace",
                        parent
                    )));
                }
            }
            diesel::insert_into(todos::table)
                .values(&NewTodoRow {
                    id: &id,
                    workspace_id: &new.workspace_id,
                    description: &new.description,
                    position: new.position,
                    status: TodoStatus::Pending.as_str(),
                    urgency: new.urgency,
                    due_date: new.due_date.as_deref(),
                    created_at: &now,
                    updated_at: &now,
                    completed_at: None,
                    deleted_at: None,
                    is_archived: false,
                })
                .execute(conn)
                .context("insert todo")?;
            super::link_new_node(conn, self.closure, &id, new.parent_id.as_deref())
        })?;
        drop(conn);
        tracing::debug!(id = %id, workspace = %new.workspace_id, parent = ?new.parent_id, "todo created");
        self.get(&id)
    }

    /// Attribute-only update; topology and workspace are left alone
    pub fn update(&self, todo: &Todo) -> Result<Todo> {
        let mut conn = self.db.conn()?;
        let updated = diesel::update(
            todos::table
                .filter(todos::id.eq(&todo.id))
                .filter(todos::deleted_at.is_null()),
        )
        .set((
            todos::description.eq(&todo.description),
            todos::position.eq(todo.position),
            todos::status.eq(&todo.status),
            todos::urgency.eq(todo.urgency),
            todos::due_date.eq(todo.due_date.as_deref()),
            todos::updated_at.eq(model::now()),
            todos::completed_at.eq(todo.completed_at.as_deref()),
            todos::is_archived.eq(todo.is_archived),
        ))
        .execute(&mut conn)
        .context("update todo")?;
        if updated == 0 {
            return Err(Error::not_found(TreeKind::Todo, &todo.id));
        }
        drop(conn);
        self.get(&todo.id)
    }

    /// Flip pending/completed, stamping or clearing `completed_at`
    pub fn toggle_status(&self, id: &str) -> Result<Todo> {
        let mut todo = self.get(id)?;
        if todo.is_pending() {
            todo.status = TodoStatus::Completed.as_str().to_string();
            todo.completed_at = Some(model::now());
        } else {
            todo.status = TodoStatus::Pending.as_str().to_string();
            todo.completed_at = None;
        }
        self.update(&todo)
    }

    pub fn archive(&self, id: &str) -> Result<Todo> {
        let mut todo = self.get(id)?;
        todo.is_archived = true;
        self.update(&todo)
    }

    /// Live todos of a workspace ordered by status, position, creation
    pub fn list_by_workspace(&self, workspace_id: &str, include_archived: bool) -> Result<Vec<Todo>> {
        let mut tail = String::from("WHERE t.workspace_id = ? AND t.deleted_at IS NULL");
        if !include_archived {
            tail.push_str(" AND t.is_archived = 0");
        }
        tail.push_str(" ORDER BY t.status, t.position, t.created_at, t.rowid");
        let mut conn = self.db.conn()?;
        self.load(&mut conn, &select(&tail), &[workspace_id])
    }

    /// Live root todos of a workspace in sibling order
    pub fn roots(&self, workspace_id: &str) -> Result<Vec<Todo>> {
        let mut conn = self.db.conn()?;
        self.load(
            &mut conn,
            &select(
                "WHERE t.workspace_id = ? AND t.deleted_at IS NULL AND NOT EXISTS \
                 (SELECT 1 FROM todo_closure p WHERE p.descendant_id = t.id AND p.depth = 1) \
                 ORDER BY t.position, t.created_at, t.rowid",
            ),
            &[workspace_id],
        )
    }

    /// Substring search over descriptions, newest first
    pub fn search(&self, query: &str, include_archived: bool) -> Result<Vec<Todo>> {
        let mut tail = String::from("WHERE t.deleted_at IS NULL AND t.description LIKE ? ESCAPE '\\'");
        if !include_archived {
            tail.push_str(" AND t.is_archived = 0");
        }
        tail.push_str(" ORDER BY t.created_at DESC, t.rowid DESC");
        let pattern = like_pattern(query);
        let mut conn = self.db.conn()?;
        self.load(&mut conn, &select(&tail), &[&pattern])
    }

    /// Completed, unarchived todos finished before `before`
    pub fn completed_before(&self, before: DateTime<Utc>) -> Result<Vec<Todo>> {
        let cutoff = model::format_ts(before);
        let mut conn = self.db.conn()?;
        self.load(
            &mut conn,
            &select(
                "WHERE t.deleted_at IS NULL AND t.status = 'completed' \
                 AND t.completed_at IS NOT NULL AND t.completed_at < ? AND t.is_archived = 0 \
                 ORDER BY t.completed_at",
            ),
            &[&cutoff],
        )
    }

    /// Archive todos completed more than `older_than` ago
    pub fn auto_archive(&self, older_than: chrono::Duration) -> Result<usize> {
        let cutoff = model::format_ts(Utc::now() - older_than);
        let mut conn = self.db.conn()?;
        let archived = diesel::update(
            todos::table
                .filter(todos::status.eq(TodoStatus::Completed.as_str()))
                .filter(todos::completed_at.is_not_null())
                .filter(todos::completed_at.lt(&cutoff))
                .filter(todos::is_archived.eq(false))
                .filter(todos::deleted_at.is_null()),
        )
        .set((todos::is_archived.eq(true), todos::updated_at.eq(model::now())))
        .execute(&mut conn)
        .context("auto-archive todos")?;
        if archived > 0 {
            tracing::info!(archived, "auto-archived completed todos");
        }
        Ok(archived)
    }

    /// Reparent a todo and optionally move its subtree to another workspace.
    ///
    /// With a new parent and no explicit workspace, the subtree adopts the
    /// parent's workspace.
    pub fn move_to_workspace(
        &self,
        id: &str,
        new_parent: Option<&str>,
        new_workspace: Option<&str>,
    ) -> Result<Todo> {
        let mut conn = self.db.conn()?;
        conn.immediate_transaction::<_, Error, _>(|conn| {
            super::reparent(conn, self.closure, id, new_parent)?;

            let parent_ws = match new_parent {
                Some(parent) => Some(self.workspace_of(conn, parent)?),
                None => None,
            };
            let target = match (new_workspace, parent_ws.as_deref()) {
                (Some(ws), Some(pws)) if ws != pws => {
                    return Err(Error::invalid(format!(
                        "parent todo belongs to workspace {}, not {}",
                        pws, ws
                    )))
                }
                (Some(ws), _) => Some(ws.to_string()),
                (None, pws) => pws.map(str::to_string),
            };

            let now = model::now();
            if let Some(ws) = target {
                if ws != self.workspace_of(conn, id)? {
                    super::ensure_live(conn, TreeKind::Workspace, &ws)?;
                    self.set_subtree_workspace(conn, id, &ws, &now)?;
                }
            }
            diesel::update(todos::table.filter(todos::id.eq(id)))
                .set(todos::updated_at.eq(&now))
                .execute(conn)
                .context("update timestamp")?;
            Ok(())
        })?;
        drop(conn);
        self.get(id)
    }

    fn set_subtree_workspace(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        workspace_id: &str,
        now: &str,
    ) -> Result<usize> {
        diesel::sql_query(
            "UPDATE todos SET workspace_id = ?, updated_at = ? \
             WHERE id IN (SELECT descendant_id FROM todo_closure WHERE ancestor_id = ?)",
        )
        .bind::<Text, _>(workspace_id)
        .bind::<Text, _>(now)
        .bind::<Text, _>(id)
        .execute(conn)
        .context("update workspace_id")
    }

    fn workspace_of(&self, conn: &mut SqliteConnection, id: &str) -> Result<String> {
        todos::table
            .filter(todos::id.eq(id))
            .filter(todos::deleted_at.is_null())
            .select(todos::workspace_id)
            .first::<String>(conn)
            .optional()
            .context("load todo workspace")?
            .ok_or_else(|| Error::not_found(TreeKind::Todo, id))
    }

    fn related(&self, tail: &str, id: &str) -> Result<Vec<Relative<Todo>>> {
        let mut conn = self.db.conn()?;
        let sql = format!("SELECT {}, tc.depth AS distance FROM todos t {}", TODO_COLUMNS, tail);
        let rows: Vec<RelativeRow> = diesel::sql_query(sql)
            .bind::<Text, _>(id)
            .load(&mut conn)
            .context("load related todos")?;
        Ok(rows
            .into_iter()
            .map(|r| Relative {
                node: r.node,
                distance: r.distance,
            })
            .collect())
    }

    fn load(&self, conn: &mut SqliteConnection, sql: &str, binds: &[&str]) -> Result<Vec<Todo>> {
        let rows = match binds {
            [] => diesel::sql_query(sql).load(conn),
            [a] => diesel::sql_query(sql).bind::<Text, _>(*a).load(conn),
            _ => return Err(Error::invalid("unsupported bind count")),
        };
        rows.context("load todos")
    }

    fn find_in(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<Todo>> {
        Ok(self.load(conn, &select("WHERE t.id = ?"), &[id])?.into_iter().next())
    }
}

impl TreeStore for TodoStore {
    type Node = Todo;

    fn get(&self, id: &str) -> Result<Todo> {
        match self.find(id)? {
            Some(t) if !t.is_deleted() => Ok(t),
            _ => Err(Error::not_found(TreeKind::Todo, id)),
        }
    }

    fn find(&self, id: &str) -> Result<Option<Todo>> {
        let mut conn = self.db.conn()?;
        self.find_in(&mut conn, id)
    }

    fn descendants(&self, id: &str) -> Result<Vec<Relative<Todo>>> {
        self.related(
            "JOIN todo_closure tc ON t.id = tc.descendant_id \
             WHERE tc.ancestor_id = ? AND tc.depth > 0 AND t.deleted_at IS NULL \
             ORDER BY tc.depth, t.position, t.created_at, t.rowid",
            id,
        )
    }

    fn ancestors(&self, id: &str) -> Result<Vec<Relative<Todo>>> {
        self.related(
            "JOIN todo_closure tc ON t.id = tc.ancestor_id \
             WHERE tc.descendant_id = ? AND tc.depth > 0 AND t.deleted_at IS NULL \
             ORDER BY tc.depth DESC",
            id,
        )
    }

    fn children(&self, id: &str) -> Result<Vec<Todo>> {
        let mut conn = self.db.conn()?;
        self.load(
            &mut conn,
            &select(
                "JOIN todo_closure tc ON t.id = tc.descendant_id \
                 WHERE tc.ancestor_id = ? AND tc.depth = 1 AND t.deleted_at IS NULL \
                 ORDER BY t.position, t.created_at, t.rowid",
            ),
            &[id],
        )
    }

    fn siblings(&self, node: &Todo) -> Result<Vec<Todo>> {
        match node.parent_id.as_deref() {
            Some(parent) => self.children(parent),
            None => self.roots(&node.workspace_id),
        }
    }

    fn move_to(&self, id: &str, new_parent: Option<&str>) -> Result<Todo> {
        self.move_to_workspace(id, new_parent, None)
    }

    fn reorder(&self, id: &str, position: i32) -> Result<Todo> {
        let mut conn = self.db.conn()?;
        super::set_position(&mut conn, TreeKind::Todo, id, position, &model::now())?;
        drop(conn);
        self.get(id)
    }

    fn delete_stamped(&self, id: &str, stamp: &str) -> Result<Vec<String>> {
        let mut conn = self.db.conn()?;
        let ids = conn.immediate_transaction::<_, Error, _>(|conn| {
            super::soft_delete(conn, self.closure, id, stamp)
        })?;
        tracing::debug!(id, cascaded = ids.len(), "todo deleted");
        Ok(ids)
    }

    fn restore(&self, snapshot: &Todo) -> Result<bool> {
        let mut conn = self.db.conn()?;
        conn.immediate_transaction::<_, Error, _>(|conn| match self.find_in(conn, &snapshot.id)? {
            None => {
                diesel::insert_into(todos::table)
                    .values(&NewTodoRow::from(snapshot))
                    .execute(conn)
                    .context("insert todo")?;
                let parent = match snapshot.parent_id.as_deref() {
                    Some(p) if super::is_live(conn, TreeKind::Todo, p)? => Some(p),
                    _ => None,
                };
                super::link_new_node(conn, self.closure, &snapshot.id, parent)?;
                Ok(true)
            }
            Some(current) if current.updated_at.as_str() > snapshot.updated_at.as_str() => Ok(false),
            Some(current) => {
                diesel::update(todos::table.filter(todos::id.eq(&snapshot.id)))
                    .set((
                        todos::description.eq(&snapshot.description),
                        todos::position.eq(snapshot.position),
                        todos::status.eq(&snapshot.status),
                        todos::urgency.eq(snapshot.urgency),
                        todos::due_date.eq(snapshot.due_date.as_deref()),
                        todos::updated_at.eq(&snapshot.updated_at),
                        todos::completed_at.eq(snapshot.completed_at.as_deref()),
                        todos::deleted_at.eq(snapshot.deleted_at.as_deref()),
                        todos::is_archived.eq(snapshot.is_archived),
                    ))
                    .execute(conn)
                    .context("restore todo")?;
                super::sync_parent(conn, self.closure, &snapshot.id, snapshot.parent_id.as_deref())?;
                if current.workspace_id != snapshot.workspace_id {
                    self.set_subtree_workspace(conn, &snapshot.id, &snapshot.workspace_id, &snapshot.updated_at)?;
                }
                Ok(true)
            }
        })
    }

    fn undelete(&self, nodes: &[DeletedNode], stamp: &str) -> Result<usize> {
        let now = model::now();
        let mut conn = self.db.conn()?;
        conn.immediate_transaction::<_, Error, _>(|conn| {
            super::undelete(conn, self.closure, nodes, stamp, &now)
        })
    }
}
