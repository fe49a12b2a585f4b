//! Closure table queries and topology mutations
//!
//! One row `(ancestor_id, descendant_id, depth)` per reachable pair, including
//! the `(id, id, 0)` self-row of every node. Both trees share the same shape,
//! so everything here is parameterized by [`TreeKind`].
//!
//! Reads return raw rows (deleted nodes included); the stores apply the
//! `deleted_at IS NULL` filter. Mutations are `pub(crate)` and must run
//! inside the caller's transaction.

use crate::error::{Context, Result};
use crate::model::TreeKind;
use diesel::prelude::*;
use diesel::sql_types::{Integer, Nullable, Text};
use diesel::sqlite::SqliteConnection;

#[derive(QueryableByName, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClosureRow {
    #[diesel(sql_type = Text)]
    pub ancestor_id: String,
    #[diesel(sql_type = Text)]
    pub descendant_id: String,
    #[diesel(sql_type = Integer)]
    pub depth: i32,
}

#[derive(QueryableByName, Debug)]
struct IdRow {
    #[diesel(sql_type = Text)]
    id: String,
}

#[derive(QueryableByName, Debug)]
struct MaxDepth {
    #[diesel(sql_type = Nullable<Integer>)]
    depth: Option<i32>,
}

/// Closure relation of one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureTable {
    kind: TreeKind,
}

impl ClosureTable {
    pub fn new(kind: TreeKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    fn table(&self) -> &'static str {
        self.kind.closure_table()
    }

    /// Strict ancestors of `id`, root-most first
    pub fn ancestors_of(&self, conn: &mut SqliteConnection, id: &str) -> Result<Vec<ClosureRow>> {
        diesel::sql_query(format!(
            "SELECT ancestor_id, descendant_id, depth FROM {} \
             WHERE descendant_id = ? AND depth > 0 ORDER BY depth DESC",
            self.table()
        ))
        .bind::<Text, _>(id)
        .load(conn)
        .context("load ancestors")
    }

    /// Strict descendants of `id`, ordered by depth then sibling order
    pub fn descendants_of(&self, conn: &mut SqliteConnection, id: &str) -> Result<Vec<ClosureRow>> {
        diesel::sql_query(format!(
            "SELECT c.ancestor_id, c.descendant_id, c.depth FROM {} c \
             JOIN {} e ON e.id = c.descendant_id \
             WHERE c.ancestor_id = ? AND c.depth > 0 \
             ORDER BY c.depth, e.position, e.created_at, e.rowid",
            self.table(),
            self.kind.entity_table()
        ))
        .bind::<Text, _>(id)
        .load(conn)
        .context("load descendants")
    }

    pub fn children_of(&self, conn: &mut SqliteConnection, id: &str) -> Result<Vec<ClosureRow>> {
        Ok(self
            .descendants_of(conn, id)?
            .into_iter()
            .filter(|row| row.depth == 1)
            .collect())
    }

    /// Number of strict ancestors; `None` when the node has no closure rows
    pub fn depth_of(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<i32>> {
        let row: MaxDepth = diesel::sql_query(format!(
            "SELECT MAX(depth) AS depth FROM {} WHERE descendant_id = ?",
            self.table()
        ))
        .bind::<Text, _>(id)
        .get_result(conn)
        .context("load depth")?;
        Ok(row.depth)
    }

    /// The depth-1 ancestor; `None` means `id` is a root
    pub fn parent_of(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<String>> {
        let rows: Vec<IdRow> = diesel::sql_query(format!(
            "SELECT ancestor_id AS id FROM {} WHERE descendant_id = ? AND depth = 1",
            self.table()
        ))
        .bind::<Text, _>(id)
        .load(conn)
        .context("load parent")?;
        Ok(rows.into_iter().next().map(|r| r.id))
    }

    /// True when `id` sits strictly below `ancestor`
    pub fn is_descendant_of(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        ancestor: &str,
    ) -> Result<bool> {
        let rows: Vec<IdRow> = diesel::sql_query(format!(
            "SELECT descendant_id AS id FROM {} \
             WHERE ancestor_id = ? AND descendant_id = ? AND depth > 0",
            self.table()
        ))
        .bind::<Text, _>(ancestor)
        .bind::<Text, _>(id)
        .load(conn)
        .context("check ancestry")?;
        Ok(!rows.is_empty())
    }

    /// `id` followed by all its descendants, shallowest first
    pub fn subtree_ids(&self, conn: &mut SqliteConnection, id: &str) -> Result<Vec<String>> {
        let rows: Vec<IdRow> = diesel::sql_query(format!(
            "SELECT descendant_id AS id FROM {} WHERE ancestor_id = ? ORDER BY depth",
            self.table()
        ))
        .bind::<Text, _>(id)
        .load(conn)
        .context("load subtree")?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    /// Nodes with a self-row and no parent row
    pub fn roots(&self, conn: &mut SqliteConnection) -> Result<Vec<String>> {
        let rows: Vec<IdRow> = diesel::sql_query(format!(
            "SELECT s.descendant_id AS id FROM {t} s \
             WHERE s.depth = 0 AND NOT EXISTS \
               (SELECT 1 FROM {t} p WHERE p.descendant_id = s.descendant_id AND p.depth = 1)",
            t = self.table()
        ))
        .load(conn)
        .context("load roots")?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    /// Every row of the relation
    pub fn rows(&self, conn: &mut SqliteConnection) -> Result<Vec<ClosureRow>> {
        diesel::sql_query(format!(
            "SELECT ancestor_id, descendant_id, depth FROM {} ORDER BY ancestor_id, depth",
            self.table()
        ))
        .load(conn)
        .context("load closure rows")
    }

    // ========================================================================
    // Mutations (caller owns the transaction)
    // ========================================================================

    pub(crate) fn insert_self(&self, conn: &mut SqliteConnection, id: &str) -> Result<()> {
        diesel::sql_query(format!(
            "INSERT INTO {} (ancestor_id, descendant_id, depth) VALUES (?, ?, 0)",
            self.table()
        ))
        .bind::<Text, _>(id)
        .bind::<Text, _>(id)
        .execute(conn)
        .context("insert self-reference")?;
        Ok(())
    }

    /// Give a detached leaf every ancestor of `parent` (and `parent` itself)
    /// at one greater depth
    pub(crate) fn attach(&self, conn: &mut SqliteConnection, id: &str, parent: &str) -> Result<usize> {
        diesel::sql_query(format!(
            "INSERT INTO {t} (ancestor_id, descendant_id, depth) \
             SELECT ancestor_id, ?, depth + 1 FROM {t} WHERE descendant_id = ?",
            t = self.table()
        ))
        .bind::<Text, _>(id)
        .bind::<Text, _>(parent)
        .execute(conn)
        .context("insert closure relationships")
    }

    /// Cut the subtree rooted at `id` off its ancestor chain, keeping the
    /// subtree's internal rows
    pub(crate) fn detach_subtree(&self, conn: &mut SqliteConnection, id: &str) -> Result<usize> {
        diesel::sql_query(format!(
            "DELETE FROM {t} \
             WHERE descendant_id IN (SELECT descendant_id FROM {t} WHERE ancestor_id = ?) \
               AND ancestor_id IN (SELECT ancestor_id FROM {t} WHERE descendant_id = ? AND depth > 0)",
            t = self.table()
        ))
        .bind::<Text, _>(id)
        .bind::<Text, _>(id)
        .execute(conn)
        .context("remove old closure relationships")
    }

    /// Cross-join `new_parent`'s ancestors (incl. itself) with the subtree of
    /// `id` (incl. itself). Requires a detached subtree.
    pub(crate) fn graft_subtree(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        new_parent: &str,
    ) -> Result<usize> {
        diesel::sql_query(format!(
            "INSERT INTO {t} (ancestor_id, descendant_id, depth) \
             SELECT p.ancestor_id, s.descendant_id, p.depth + s.depth + 1 \
             FROM {t} p CROSS JOIN {t} s \
             WHERE p.descendant_id = ? AND s.ancestor_id = ?",
            t = self.table()
        ))
        .bind::<Text, _>(new_parent)
        .bind::<Text, _>(id)
        .execute(conn)
        .context("add new closure relationships")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use diesel::connection::SimpleConnection;

    fn insert_ws(conn: &mut SqliteConnection, id: &str, position: i32) {
        conn.batch_execute(&format!(
            "INSERT INTO workspaces (id, name, position, is_expanded, created_at, updated_at) \
             VALUES ('{id}', '{id}', {position}, 1, '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z')"
        ))
        .unwrap();
    }

    /// a -> b -> c, a -> d
    fn build(conn: &mut SqliteConnection, ct: ClosureTable) {
        for (id, pos, parent) in [("a", 0, None), ("b", 1, Some("a")), ("c", 0, Some("b")), ("d", 0, Some("a"))] {
            insert_ws(conn, id, pos);
            ct.insert_self(conn, id).unwrap();
            if let Some(p) = parent {
                ct.attach(conn, id, p).unwrap();
            }
        }
    }

    #[test]
    fn test_queries_on_small_tree() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        let ct = ClosureTable::new(TreeKind::Workspace);
        build(&mut conn, ct);

        let ancestors: Vec<String> = ct
            .ancestors_of(&mut conn, "c")
            .unwrap()
            .into_iter()
            .map(|r| r.ancestor_id)
            .collect();
        assert_eq!(ancestors, vec!["a", "b"]);

        // d has position 0, b has position 1
        let children: Vec<String> = ct
            .children_of(&mut conn, "a")
            .unwrap()
            .into_iter()
            .map(|r| r.descendant_id)
            .collect();
        assert_eq!(children, vec!["d", "b"]);

        let descendants = ct.descendants_of(&mut conn, "a").unwrap();
        assert_eq!(descendants.len(), 3);
        assert_eq!(descendants.last().unwrap().descendant_id, "c");
        assert_eq!(descendants.last().unwrap().depth, 2);

        assert_eq!(ct.depth_of(&mut conn, "c").unwrap(), Some(2));
        assert_eq!(ct.depth_of(&mut conn, "a").unwrap(), Some(0));
        assert_eq!(ct.depth_of(&mut conn, "missing").unwrap(), None);
        assert_eq!(ct.parent_of(&mut conn, "c").unwrap().as_deref(), Some("b"));
        assert_eq!(ct.parent_of(&mut conn, "a").unwrap(), None);
        assert!(ct.is_descendant_of(&mut conn, "c", "a").unwrap());
        assert!(!ct.is_descendant_of(&mut conn, "a", "a").unwrap());
        assert_eq!(ct.roots(&mut conn).unwrap(), vec!["a"]);
        assert_eq!(ct.subtree_ids(&mut conn, "b").unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn test_detach_and_graft_subtree() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        let ct = ClosureTable::new(TreeKind::Workspace);
        build(&mut conn, ct);

        // Move b (with c) under d
        ct.detach_subtree(&mut conn, "b").unwrap();
        assert_eq!(ct.parent_of(&mut conn, "b").unwrap(), None);
        assert_eq!(ct.parent_of(&mut conn, "c").unwrap().as_deref(), Some("b"));

        ct.graft_subtree(&mut conn, "b", "d").unwrap();
        assert_eq!(ct.parent_of(&mut conn, "b").unwrap().as_deref(), Some("d"));
        assert_eq!(ct.depth_of(&mut conn, "c").unwrap(), Some(3));
        let chain: Vec<String> = ct
            .ancestors_of(&mut conn, "c")
            .unwrap()
            .into_iter()
            .map(|r| r.ancestor_id)
            .collect();
        assert_eq!(chain, vec!["a", "d", "b"]);
    }
}
