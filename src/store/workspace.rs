//! Workspace tree store

use super::{DeletedNode, Relative, TreeStore};
use crate::closure::ClosureTable;
use crate::db::Database;
use crate::error::{Context, Error, Result};
use crate::model::{self, NewWorkspace, TreeKind, Workspace, ARCHIVE_POSITION, ARCHIVE_WORKSPACE};
use crate::schema::workspaces;
use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel::sqlite::SqliteConnection;
use uuid::Uuid;

const WORKSPACE_COLUMNS: &str = "w.id, w.name, w.position, w.is_expanded, w.created_at, \
    w.updated_at, w.deleted_at, \
    COALESCE((SELECT MAX(depth) FROM workspace_closure WHERE descendant_id = w.id), 0) AS depth, \
    (SELECT ancestor_id FROM workspace_closure WHERE descendant_id = w.id AND depth = 1) AS parent_id";

fn select(tail: &str) -> String {
    format!("SELECT {} FROM workspaces w {}", WORKSPACE_COLUMNS, tail)
}

/// Insertable workspace row
#[derive(Insertable)]
#[diesel(table_name = workspaces)]
struct NewWorkspaceRow<'a> {
    id: &'a str,
    name: &'a str,
    position: i32,
    is_expanded: bool,
    created_at: &'a str,
    updated_at: &'a str,
    deleted_at: Option<&'a str>,
}

/// Workspace with the closure depth relative to a query's anchor node
#[derive(QueryableByName)]
struct RelativeRow {
    #[diesel(embed)]
    node: Workspace,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    distance: i32,
}

#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    db: Database,
    closure: ClosureTable,
}

impl WorkspaceStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            closure: ClosureTable::new(TreeKind::Workspace),
        }
    }

    pub fn closure(&self) -> ClosureTable {
        self.closure
    }

    /// Insert a workspace, its self-row and its ancestor chain atomically
    pub fn create(&self, new: NewWorkspace) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let now = model::now();
        let mut conn = self.db.conn()?;
        conn.immediate_transaction::<_, Error, _>(|conn| {
            if let Some(parent) = new.parent_id.as_deref() {
                super::ensure_live(conn, TreeKind::Workspace, parent)?;
            }
            diesel::insert_into(workspaces::table)
                .values(&NewWorkspaceRow {
                    id: &id,
                    name: &new.name,
                    position: new.position,
                    is_expanded: new.is_expanded,
                    created_at: &now,
                    updated_at: &now,
                    deleted_at: None,
                })
                .execute(conn)
                .context("insert workspace")?;
            super::link_new_node(conn, self.closure, &id, new.parent_id.as_deref())
        })?;
        drop(conn);
        tracing::debug!(id = %id, name = %new.name, parent = ?new.parent_id, "workspace created");
        self.get(&id)
    }

    /// Attribute-only update (name, position, expanded flag)
    pub fn update(&self, ws: &Workspace) -> Result<Workspace> {
        let mut conn = self.db.conn()?;
        let updated = diesel::update(
            workspaces::table
                .filter(workspaces::id.eq(&ws.id))
                .filter(workspaces::deleted_at.is_null()),
        )
        .set((
            workspaces::name.eq(&ws.name),
            workspaces::position.eq(ws.position),
            workspaces::is_expanded.eq(ws.is_expanded),
            workspaces::updated_at.eq(model::now()),
        ))
        .execute(&mut conn)
        .context("update workspace")?;
        if updated == 0 {
            return Err(Error::not_found(TreeKind::Workspace, &ws.id));
        }
        drop(conn);
        self.get(&ws.id)
    }

    pub fn rename(&self, id: &str, name: &str) -> Result<Workspace> {
        let mut ws = self.get(id)?;
        ws.name = name.to_string();
        self.update(&ws)
    }

    pub fn toggle_expanded(&self, id: &str) -> Result<Workspace> {
        let mut ws = self.get(id)?;
        ws.is_expanded = !ws.is_expanded;
        self.update(&ws)
    }

    /// All live workspaces ordered by position then name
    pub fn list_all(&self) -> Result<Vec<Workspace>> {
        let mut conn = self.db.conn()?;
        self.load(
            &mut conn,
            &select("WHERE w.deleted_at IS NULL ORDER BY w.position, w.name"),
            None,
        )
    }

    /// Live workspaces without a parent
    pub fn roots(&self) -> Result<Vec<Workspace>> {
        let mut conn = self.db.conn()?;
        self.load(
            &mut conn,
            &select(
                "WHERE w.deleted_at IS NULL AND NOT EXISTS \
                 (SELECT 1 FROM workspace_closure p WHERE p.descendant_id = w.id AND p.depth = 1) \
                 ORDER BY w.position, w.created_at, w.rowid",
            ),
            None,
        )
    }

    /// The `_archive` system workspace, created on first use
    pub fn get_or_create_archive(&self) -> Result<Workspace> {
        let mut conn = self.db.conn()?;
        let existing = diesel::sql_query(select("WHERE w.name = ? AND w.deleted_at IS NULL LIMIT 1"))
            .bind::<Text, _>(ARCHIVE_WORKSPACE)
            .load::<Workspace>(&mut conn)
            .context("load archive workspace")?;
        drop(conn);
        match existing.into_iter().next() {
            Some(ws) => Ok(ws),
            None => self.create(NewWorkspace {
                name: ARCHIVE_WORKSPACE.to_string(),
                position: ARCHIVE_POSITION,
                is_expanded: false,
                parent_id: None,
            }),
        }
    }

    fn related(&self, tail: &str, id: &str) -> Result<Vec<Relative<Workspace>>> {
        let mut conn = self.db.conn()?;
        let sql = format!(
            "SELECT {}, wc.depth AS distance FROM workspaces w {}",
            WORKSPACE_COLUMNS, tail
        );
        let rows: Vec<RelativeRow> = diesel::sql_query(sql)
            .bind::<Text, _>(id)
            .load(&mut conn)
            .context("load related workspaces")?;
        Ok(rows
            .into_iter()
            .map(|r| Relative {
                node: r.node,
                distance: r.distance,
            })
            .collect())
    }

    fn load(&self, conn: &mut SqliteConnection, sql: &str, bind: Option<&str>) -> Result<Vec<Workspace>> {
        let query = diesel::sql_query(sql);
        let rows = match bind {
            Some(value) => query.bind::<Text, _>(value).load(conn),
            None => query.load(conn),
        };
        rows.context("load workspaces")
    }

    fn find_in(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<Workspace>> {
        let rows = self.load(conn, &select("WHERE w.id = ?"), Some(id))?;
        Ok(rows.into_iter().next())
    }
}

impl TreeStore for WorkspaceStore {
    type Node = Workspace;

    fn get(&self, id: &str) -> Result<Workspace> {
        match self.find(id)? {
            Some(ws) if !ws.is_deleted() => Ok(ws),
            _ => Err(Error::not_found(TreeKind::Workspace, id)),
        }
    }

    fn find(&self, id: &str) -> Result<Option<Workspace>> {
        let mut conn = self.db.conn()?;
        self.find_in(&mut conn, id)
    }

    fn descendants(&self, id: &str) -> Result<Vec<Relative<Workspace>>> {
        self.related(
            "JOIN workspace_closure wc ON w.id = wc.descendant_id \
             WHERE wc.ancestor_id = ? AND wc.depth > 0 AND w.deleted_at IS NULL \
             ORDER BY wc.depth, w.position, w.created_at, w.rowid",
            id,
        )
    }

    fn ancestors(&self, id: &str) -> Result<Vec<Relative<Workspace>>> {
        self.related(
            "JOIN workspace_closure wc ON w.id = wc.ancestor_id \
             WHERE wc.descendant_id = ? AND wc.depth > 0 AND w.deleted_at IS NULL \
             ORDER BY wc.depth DESC",
            id,
        )
    }

    fn children(&self, id: &str) -> Result<Vec<Workspace>> {
        let mut conn = self.db.conn()?;
        self.load(
            &mut conn,
            &select(
                "JOIN workspace_closure wc ON w.id = wc.descendant_id \
                 WHERE wc.ancestor_id = ? AND wc.depth = 1 AND w.deleted_at IS NULL \
                 ORDER BY w.position, w.created_at, w.rowid",
            ),
            Some(id),
        )
    }

    fn siblings(&self, node: &Workspace) -> Result<Vec<Workspace>> {
        match node.parent_id.as_deref() {
            Some(parent) => self.children(parent),
            None => self.roots(),
        }
    }

    fn move_to(&self, id: &str, new_parent: Option<&str>) -> Result<Workspace> {
        let mut conn = self.db.conn()?;
        conn.immediate_transaction::<_, Error, _>(|conn| {
            super::reparent(conn, self.closure, id, new_parent)?;
            diesel::update(workspaces::table.filter(workspaces::id.eq(id)))
                .set(workspaces::updated_at.eq(model::now()))
                .execute(conn)
                .context("update timestamp")?;
            Ok(())
        })?;
        drop(conn);
        self.get(id)
    }

    fn reorder(&self, id: &str, position: i32) -> Result<Workspace> {
        let mut conn = self.db.conn()?;
        super::set_position(&mut conn, TreeKind::Workspace, id, position, &model::now())?;
        drop(conn);
        self.get(id)
    }

    fn delete_stamped(&self, id: &str, stamp: &str) -> Result<Vec<String>> {
        let mut conn = self.db.conn()?;
        let ids = conn.immediate_transaction::<_, Error, _>(|conn| {
            super::soft_delete(conn, self.closure, id, stamp)
        })?;
        tracing::debug!(id, cascaded = ids.len(), "workspace deleted");
        Ok(ids)
    }

    fn restore(&self, snapshot: &Workspace) -> Result<bool> {
        let mut conn = self.db.conn()?;
        conn.immediate_transaction::<_, Error, _>(|conn| {
            match self.find_in(conn, &snapshot.id)? {
                None => {
                    diesel::insert_into(workspaces::table)
                        .values(&NewWorkspaceRow {
                            id: &snapshot.id,
                            name: &snapshot.name,
                            position: snapshot.position,
                            is_expanded: snapshot.is_expanded,
                            created_at: &snapshot.created_at,
                            updated_at: &snapshot.updated_at,
                            deleted_at: snapshot.deleted_at.as_deref(),
                        })
                        .execute(conn)
                        .context("insert workspace")?;
                    let parent = match snapshot.parent_id.as_deref() {
                        Some(p) if super::is_live(conn, TreeKind::Workspace, p)? => Some(p),
                        _ => None,
                    };
                    super::link_new_node(conn, self.closure, &snapshot.id, parent)?;
                    Ok(true)
                }
                Some(current) if current.updated_at.as_str() > snapshot.updated_at.as_str() => Ok(false),
                Some(_) => {
                    diesel::update(workspaces::table.filter(workspaces::id.eq(&snapshot.id)))
                        .set((
                            workspaces::name.eq(&snapshot.name),
                            workspaces::position.eq(snapshot.position),
                            workspaces::is_expanded.eq(snapshot.is_expanded),
                            workspaces::updated_at.eq(&snapshot.updated_at),
                            workspaces::deleted_at.eq(snapshot.deleted_at.as_deref()),
                        ))
                        .execute(conn)
                        .context("restore workspace")?;
                    super::sync_parent(conn, self.closure, &snapshot.id, snapshot.parent_id.as_deref())?;
                    Ok(true)
                }
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
