//! Tree entity stores
//!
//! Each store owns one entity table and its closure table. Multi-statement
//! mutations run in a single immediate transaction, so a failure anywhere
//! leaves both tables exactly as they were.

pub mod todo;
pub mod workspace;

pub use todo::TodoStore;
pub use workspace::WorkspaceStore;

use crate::closure::ClosureTable;
use crate::error::{Context, Error, Result};
use crate::model::{self, Todo, TreeKind, Workspace};
use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel::sqlite::SqliteConnection;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A node plus its distance from the node a query started at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relative<T> {
    pub node: T,
    pub distance: i32,
}

/// Common view over workspaces and todos
pub trait TreeNode: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: TreeKind;

    fn id(&self) -> &str;
    fn parent_id(&self) -> Option<&str>;
    fn position(&self) -> i32;
    fn depth(&self) -> i32;
    fn updated_at(&self) -> &str;
    fn deleted_at(&self) -> Option<&str>;

    /// Restamp `updated_at` so a snapshot wins last-writer-wins checks
    fn touch(&mut self, stamp: String);
}

impl TreeNode for Workspace {
    const KIND: TreeKind = TreeKind::Workspace;

    fn id(&self) -> &str {
        &self.id
    }
    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }
    fn position(&self) -> i32 {
        self.position
    }
    fn depth(&self) -> i32 {
        self.depth
    }
    fn updated_at(&self) -> &str {
        &self.updated_at
    }
    fn deleted_at(&self) -> Option<&str> {
        self.deleted_at.as_deref()
    }
    fn touch(&mut self, stamp: String) {
        self.updated_at = stamp;
    }
}

impl TreeNode for Todo {
    const KIND: TreeKind = TreeKind::Todo;

    fn id(&self) -> &str {
        &self.id
    }
    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }
    fn position(&self) -> i32 {
        self.position
    }
    fn depth(&self) -> i32 {
        self.depth
    }
    fn updated_at(&self) -> &str {
        &self.updated_at
    }
    fn deleted_at(&self) -> Option<&str> {
        self.deleted_at.as_deref()
    }
    fn touch(&mut self, stamp: String) {
        self.updated_at = stamp;
    }
}

/// Topology operations shared by both stores
pub trait TreeStore: Send + Sync {
    type Node: TreeNode;

    fn kind(&self) -> TreeKind {
        <Self::Node as TreeNode>::KIND
    }

    /// Live node by id
    fn get(&self, id: &str) -> Result<Self::Node>;

    /// Node by id, soft-deleted included
    fn find(&self, id: &str) -> Result<Option<Self::Node>>;

    /// Live strict descendants, shallowest first, with distance from `id`
    fn descendants(&self, id: &str) -> Result<Vec<Relative<Self::Node>>>;

    /// Live strict ancestors, root-most first, with distance from `id`
    fn ancestors(&self, id: &str) -> Result<Vec<Relative<Self::Node>>>;

    /// Live direct children in sibling order
    fn children(&self, id: &str) -> Result<Vec<Self::Node>>;

    /// Live nodes sharing `node`'s parent (or root scope), `node` included
    fn siblings(&self, node: &Self::Node) -> Result<Vec<Self::Node>>;

    fn move_to(&self, id: &str, new_parent: Option<&str>) -> Result<Self::Node>;

    fn reorder(&self, id: &str, position: i32) -> Result<Self::Node>;

    /// Soft-delete `id` and its subtree; returns the stamped ids shallowest first
    fn delete(&self, id: &str) -> Result<Vec<String>> {
        self.delete_stamped(id, &model::now())
    }

    /// [`TreeStore::delete`] with a caller-chosen deletion stamp
    fn delete_stamped(&self, id: &str, stamp: &str) -> Result<Vec<String>>;

    /// Write a snapshot back unless the stored row is newer. Returns whether
    /// anything was written.
    fn restore(&self, snapshot: &Self::Node) -> Result<bool>;

    /// Clear a deletion stamp on the given nodes and re-link their closure rows
    fn undelete(&self, nodes: &[DeletedNode], stamp: &str) -> Result<usize>;
}

/// One node stamped by a cascading delete, as recorded for undo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct DeletedNode {
    pub id: String,
    pub parent_id: Option<String>,
}

/// What a cascading delete touched; enough to reverse it after the
/// repairer has pruned the subtree's closure rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct DeleteRecord {
    pub stamp: String,
    pub nodes: Vec<DeletedNode>,
}

// ============================================================================
// Shared SQL helpers (run inside the caller's transaction)
// ============================================================================

#[derive(QueryableByName, Debug)]
struct IdRow {
    #[diesel(sql_type = Text)]
    id: String,
}

pub(crate) fn is_live(conn: &mut SqliteConnection, kind: TreeKind, id: &str) -> Result<bool> {
    let rows: Vec<IdRow> = diesel::sql_query(format!(
        "SELECT id FROM {} WHERE id = ? AND deleted_at IS NULL",
        kind.entity_table()
    ))
    .bind::<Text, _>(id)
    .load(conn)
    .context("check node")?;
    Ok(!rows.is_empty())
}

pub(crate) fn ensure_live(conn: &mut SqliteConnection, kind: TreeKind, id: &str) -> Result<()> {
    if is_live(conn, kind, id)? {
        Ok(())
    } else {
        Err(Error::not_found(kind, id))
    }
}

/// Self-row plus the parent's ancestor chain for a freshly inserted node
pub(crate) fn link_new_node(
    conn: &mut SqliteConnection,
    closure: ClosureTable,
    id: &str,
    parent: Option<&str>,
) -> Result<()> {
    closure.insert_self(conn, id)?;
    if let Some(parent) = parent {
        closure.attach(conn, id, parent)?;
    }
    Ok(())
}

/// Detach the subtree at `id` and graft it under `new_parent` (or make it a
/// root). Rejects moves that would create a cycle.
pub(crate) fn reparent(
    conn: &mut SqliteConnection,
    closure: ClosureTable,
    id: &str,
    new_parent: Option<&str>,
) -> Result<()> {
    let kind = closure.kind();
    ensure_live(conn, kind, id)?;
    if let Some(parent) = new_parent {
        ensure_live(conn, kind, parent)?;
        if parent == id {
            return Err(Error::invalid(format!("cannot move {} {} under itself", kind, id)));
        }
        if closure.is_descendant_of(conn, parent, id)? {
            return Err(Error::invalid(format!(
                "cannot move {} {} under its own descendant {}",
                kind, id, parent
            )));
        }
    }

    let removed = closure.detach_subtree(conn, id)?;
    let added = match new_parent {
        Some(parent) => closure.graft_subtree(conn, id, parent)?,
        None => 0,
    };
    tracing::debug!(%kind, id, ?new_parent, removed, added, "reparented subtree");
    Ok(())
}

/// Stamp `deleted_at` on `id` and every live descendant
pub(crate) fn soft_delete(
    conn: &mut SqliteConnection,
    closure: ClosureTable,
    id: &str,
    stamp: &str,
) -> Result<Vec<String>> {
    let kind = closure.kind();
    ensure_live(conn, kind, id)?;

    let rows: Vec<IdRow> = diesel::sql_query(format!(
        "SELECT e.id FROM {e} e JOIN {c} c ON c.descendant_id = e.id \
         WHERE c.ancestor_id = ? AND e.deleted_at IS NULL ORDER BY c.depth",
        e = kind.entity_table(),
        c = kind.closure_table()
    ))
    .bind::<Text, _>(id)
    .load(conn)
    .context("load subtree for delete")?;

    diesel::sql_query(format!(
        "UPDATE {e} SET deleted_at = ?, updated_at = ? \
         WHERE id IN (SELECT descendant_id FROM {c} WHERE ancestor_id = ?) AND deleted_at IS NULL",
        e = kind.entity_table(),
        c = kind.closure_table()
    ))
    .bind::<Text, _>(stamp)
    .bind::<Text, _>(stamp)
    .bind::<Text, _>(id)
    .execute(conn)
    .context(&format!("delete {}", kind))?;

    Ok(rows.into_iter().map(|r| r.id).collect())
}

pub(crate) fn set_position(
    conn: &mut SqliteConnection,
    kind: TreeKind,
    id: &str,
    position: i32,
    stamp: &str,
) -> Result<()> {
    let updated = diesel::sql_query(format!(
        "UPDATE {} SET position = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        kind.entity_table()
    ))
    .bind::<diesel::sql_types::Integer, _>(position)
    .bind::<Text, _>(stamp)
    .bind::<Text, _>(id)
    .execute(conn)
    .context(&format!("reorder {}", kind))?;
    if updated == 0 {
        return Err(Error::not_found(kind, id));
    }
    Ok(())
}

/// Clear the stamp of one cascading delete and restore closure links for the
/// nodes whose rows were pruned in the meantime
pub(crate) fn undelete(
    conn: &mut SqliteConnection,
    closure: ClosureTable,
    nodes: &[DeletedNode],
    stamp: &str,
    now: &str,
) -> Result<usize> {
    let kind = closure.kind();
    let mut restored = 0;
    for node in nodes {
        restored += diesel::sql_query(format!(
            "UPDATE {} SET deleted_at = NULL, updated_at = ? WHERE id = ? AND deleted_at = ?",
            kind.entity_table()
        ))
        .bind::<Text, _>(now)
        .bind::<Text, _>(&node.id)
        .bind::<Text, _>(stamp)
        .execute(conn)
        .context(&format!("undelete {}", kind))?;

        diesel::sql_query(format!(
            "INSERT OR IGNORE INTO {} (ancestor_id, descendant_id, depth) VALUES (?, ?, 0)",
            kind.closure_table()
        ))
        .bind::<Text, _>(&node.id)
        .bind::<Text, _>(&node.id)
        .execute(conn)
        .context("restore self-reference")?;

        if let Some(parent) = node.parent_id.as_deref() {
            if closure.parent_of(conn, &node.id)?.is_none() && is_live(conn, kind, parent)? {
                closure.attach(conn, &node.id, parent)?;
            }
        }
    }
    Ok(restored)
}

/// Make sure a snapshot's parent link matches the closure table
pub(crate) fn sync_parent(
    conn: &mut SqliteConnection,
    closure: ClosureTable,
    id: &str,
    wanted: Option<&str>,
) -> Result<()> {
    diesel::sql_query(format!(
        "INSERT OR IGNORE INTO {} (ancestor_id, descendant_id, depth) VALUES (?, ?, 0)",
        closure.kind().closure_table()
    ))
    .bind::<Text, _>(id)
    .bind::<Text, _>(id)
    .execute(conn)
    .context("restore self-reference")?;

    let current = closure.parent_of(conn, id)?;
    if current.as_deref() == wanted {
        return Ok(());
    }
    // A parent that no longer exists leaves the node at the root
    let target = match wanted {
        Some(p) if is_live(conn, closure.kind(), p)? => Some(p),
        _ => None,
    };
    if current.as_deref() == target {
        return Ok(());
    }
    if is_live(conn, closure.kind(), id)? {
        reparent(conn, closure, id, target)
    } else {
        Ok(())
    }
}
