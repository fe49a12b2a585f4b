//! Closure table integrity checks and repair
//!
//! A repair pass restores the `(id, id, 0)` row of every live node, prunes
//! rows that mention a soft-deleted or missing node, and fills transitive
//! gaps between live nodes. It is idempotent: running it twice reports
//! nothing the second time.

use crate::db::Database;
use crate::error::{Context, Error, Result};
use crate::model::TreeKind;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;

/// Upper bound on gap-filling passes; each pass closes one more hop
const MAX_FILL_PASSES: usize = 64;

#[derive(QueryableByName, Debug)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

/// Findings of one check or repair pass over a single tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub missing_self_rows: usize,
    pub orphaned_rows: usize,
    pub transitive_gaps: usize,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.missing_self_rows + self.orphaned_rows + self.transitive_gaps
    }
}

impl std::fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} missing self rows, {} orphaned rows, {} transitive gaps",
            self.missing_self_rows, self.orphaned_rows, self.transitive_gaps
        )
    }
}

fn missing_self_sql(kind: TreeKind) -> String {
    format!(
        "FROM {e} e WHERE e.deleted_at IS NULL AND NOT EXISTS \
         (SELECT 1 FROM {c} c WHERE c.ancestor_id = e.id AND c.descendant_id = e.id AND c.depth = 0)",
        e = kind.entity_table(),
        c = kind.closure_table()
    )
}

fn orphaned_sql(kind: TreeKind) -> String {
    format!(
        "FROM {c} WHERE ancestor_id NOT IN (SELECT id FROM {e} WHERE deleted_at IS NULL) \
         OR descendant_id NOT IN (SELECT id FROM {e} WHERE deleted_at IS NULL)",
        e = kind.entity_table(),
        c = kind.closure_table()
    )
}

fn gaps_sql(kind: TreeKind) -> String {
    format!(
        "FROM {c} x JOIN {c} y ON x.descendant_id = y.ancestor_id \
         WHERE x.depth > 0 AND y.depth > 0 AND NOT EXISTS \
         (SELECT 1 FROM {c} z WHERE z.ancestor_id = x.ancestor_id \
          AND z.descendant_id = y.descendant_id AND z.depth = x.depth + y.depth)",
        c = kind.closure_table()
    )
}

fn count(conn: &mut SqliteConnection, from: &str) -> Result<usize> {
    let row: CountRow = diesel::sql_query(format!("SELECT COUNT(*) AS count {}", from))
        .get_result(conn)
        .context("count integrity findings")?;
    Ok(row.count as usize)
}

fn inspect(conn: &mut SqliteConnection, kind: TreeKind) -> Result<IntegrityReport> {
    Ok(IntegrityReport {
        missing_self_rows: count(conn, &missing_self_sql(kind))?,
        orphaned_rows: count(conn, &orphaned_sql(kind))?,
        transitive_gaps: count(conn, &gaps_sql(kind))?,
    })
}

#[derive(Debug, Clone)]
pub struct Repairer {
    db: Database,
}

impl Repairer {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Report problems without touching anything
    pub fn check(&self, kind: TreeKind) -> Result<IntegrityReport> {
        let mut conn = self.db.conn()?;
        inspect(&mut conn, kind)
    }

    /// Fix one tree in a single transaction; returns what was fixed
    pub fn repair(&self, kind: TreeKind) -> Result<IntegrityReport> {
        let mut conn = self.db.conn()?;
        let fixed = conn.immediate_transaction::<_, Error, _>(|conn| {
            let missing_self_rows = diesel::sql_query(format!(
                "INSERT OR IGNORE INTO {c} (ancestor_id, descendant_id, depth) \
                 SELECT e.id, e.id, 0 {from}",
                c = kind.closure_table(),
                from = missing_self_sql(kind)
            ))
            .execute(conn)
            .context("insert missing self rows")?;

            let orphaned_rows = diesel::sql_query(format!("DELETE {}", orphaned_sql(kind)))
                .execute(conn)
                .context("prune orphaned closure rows")?;

            let mut transitive_gaps = 0;
            for _ in 0..MAX_FILL_PASSES {
                let filled = diesel::sql_query(format!(
                    "INSERT OR IGNORE INTO {c} (ancestor_id, descendant_id, depth) \
                     SELECT DISTINCT x.ancestor_id, y.descendant_id, x.depth + y.depth {from}",
                    c = kind.closure_table(),
                    from = gaps_sql(kind)
                ))
                .execute(conn)
                .context("fill transitive gaps")?;
                if filled == 0 {
                    break;
                }
                transitive_gaps += filled;
            }

            let remaining = count(conn, &gaps_sql(kind))?;
            if remaining > 0 {
                // Conflicting depths for the same pair cannot be resolved here
                return Err(Error::IntegrityViolation(format!(
                    "{} closure has {} contradictory rows",
                    kind, remaining
                )));
            }

            Ok(IntegrityReport {
                missing_self_rows,
                orphaned_rows,
                transitive_gaps,
            })
        })?;

        if fixed.is_clean() {
            tracing::debug!(%kind, "closure table consistent");
        } else {
            tracing::warn!(%kind, %fixed, "repaired closure integrity violations");
        }
        Ok(fixed)
    }

    /// Repair both trees, workspaces first
    pub fn repair_all(&self) -> Result<Vec<(TreeKind, IntegrityReport)>> {
        TreeKind::all()
            .into_iter()
            .map(|kind| Ok((kind, self.repair(kind)?)))
            .collect()
    }
}
