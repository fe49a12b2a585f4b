//! Write-ahead operation log
//!
//! Every mutation is appended to `operation_log` before it counts as
//! committed. Appended operations queue in memory and are handed to the
//! apply function in one batch once appends have been quiet for the
//! debounce interval.
//!
//! # Thread Lifecycle
//!
//! One background flusher thread per log:
//! - `append()` moves the flush deadline to `now + debounce` and wakes it
//! - the thread sleeps until the deadline passes unchanged, then flushes
//! - `shutdown()` (or `Drop`) stops the thread after a final flush
//!
//! The apply function always runs with the state lock released, so it may
//! call back into the stores freely. Appends hold one lock from the row
//! insert until the operation is queued, and flushes hold another, so
//! batches reach the apply function in log order.

pub mod operation;

pub use operation::{NewOperation, Operation, OperationType, Payload};

use crate::db::Database;
use crate::error::{Context, Error, Result};
use crate::model;
use crate::schema::operation_log;
use diesel::prelude::*;
use operation::{NewOperationRow, OperationRow};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Callback that writes a batch of operations to the entity tables
pub type ApplyFn = Arc<dyn Fn(&[Operation]) -> Result<()> + Send + Sync>;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);
pub const DEFAULT_UNDO_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct WalConfig {
    /// Quiet period after the last append before a batch is flushed
    pub debounce: Duration,
    /// Default depth of the undo candidate stack
    pub undo_limit: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            undo_limit: DEFAULT_UNDO_LIMIT,
        }
    }
}

/// Result of replaying the unapplied tail at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    pub recovered: usize,
}

#[derive(Default)]
struct PendingState {
    pending: Vec<Operation>,
    deadline: Option<Instant>,
    shutdown: bool,
}

struct Shared {
    db: Database,
    apply: ApplyFn,
    debounce: Duration,
    state: Mutex<PendingState>,
    wake: Condvar,
    append_lock: Mutex<()>,
    flush_lock: Mutex<()>,
}

impl Shared {
    /// Swap out the pending batch, apply it, mark it applied
    fn flush_batch(&self) -> Result<usize> {
        let _serial = self.flush_lock.lock();
        let mut batch = {
            let mut state = self.state.lock();
            state.deadline = None;
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return Ok(0);
        }
        batch.sort_by_key(|op| op.id);

        if let Err(e) = (self.apply)(&batch) {
            tracing::error!(
                error = %e,
                first = batch[0].id,
                count = batch.len(),
                "apply failed, batch left unapplied for recovery"
            );
            return Err(e);
        }
        let ids: Vec<i64> = batch.iter().map(|op| op.id).collect();
        mark_applied(&self.db, &ids)?;
        tracing::debug!(count = ids.len(), "flushed operation batch");
        Ok(ids.len())
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                break;
            }
            match state.deadline {
                None => self.wake.wait(&mut state),
                Some(deadline) if Instant::now() >= deadline => {
                    MutexGuard::unlocked(&mut state, || {
                        // Failures are reported inside flush_batch
                        let _ = self.flush_batch();
                    });
                }
                Some(deadline) => {
                    self.wake.wait_until(&mut state, deadline);
                }
            }
        }
        drop(state);
        if let Err(e) = self.flush_batch() {
            tracing::error!(error = %e, "final flush failed");
        }
    }
}

fn mark_applied(db: &Database, ids: &[i64]) -> Result<()> {
    let mut conn = db.conn()?;
    conn.immediate_transaction::<_, Error, _>(|conn| {
        for chunk in ids.chunks(500) {
            diesel::update(operation_log::table.filter(operation_log::id.eq_any(chunk)))
                .set(operation_log::applied.eq(true))
                .execute(conn)
                .context("mark operations applied")?;
        }
        Ok(())
    })
}

fn load(rows: Vec<OperationRow>) -> Result<Vec<Operation>> {
    rows.into_iter().map(Operation::try_from).collect()
}

/// Durable, debounced operation journal
pub struct Wal {
    shared: Arc<Shared>,
    undo_limit: usize,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("debounce", &self.shared.debounce)
            .field("undo_limit", &self.undo_limit)
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl Wal {
    /// Open the log and start its flusher thread
    pub fn open(db: Database, config: WalConfig, apply: ApplyFn) -> Result<Self> {
        let shared = Arc::new(Shared {
            db,
            apply,
            debounce: config.debounce,
            state: Mutex::new(PendingState::default()),
            wake: Condvar::new(),
            append_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("lazytodo-wal".to_string())
            .spawn(move || worker.run())
            .map_err(|e| Error::Connection(format!("failed to start WAL flusher: {}", e)))?;
        Ok(Self {
            shared,
            undo_limit: config.undo_limit,
            flusher: Mutex::new(Some(handle)),
        })
    }

    /// Persist an operation and queue it for the next flush.
    ///
    /// The row is committed before this returns.
    pub fn append(&self, op: NewOperation) -> Result<Operation> {
        let payload = serde_json::to_string(&op.payload)?;
        // Held until the operation is queued, so ids enter `pending` in order
        let _serial = self.shared.append_lock.lock();
        let created_at = model::now();
        let mut conn = self.shared.db.conn()?;
        let id = conn.immediate_transaction::<_, Error, _>(|conn| {
            diesel::insert_into(operation_log::table)
                .values(&NewOperationRow {
                    operation_type: op.operation_type.as_str(),
                    entity_type: op.entity_type.as_str(),
                    entity_id: &op.entity_id,
                    payload: &payload,
                    applied: false,
                    is_undone: false,
                    undo_group_id: op.undo_group_id.as_deref(),
                    created_at: &created_at,
                })
                .execute(conn)
                .context("append operation")?;
            diesel::select(diesel::dsl::sql::<diesel::sql_types::BigInt>("last_insert_rowid()"))
                .get_result::<i64>(conn)
                .context("read operation id")
        })?;
        drop(conn);

        let logged = Operation {
            id,
            operation_type: op.operation_type,
            entity_type: op.entity_type,
            entity_id: op.entity_id,
            payload: op.payload,
            applied: false,
            is_undone: false,
            undone_at: None,
            undo_group_id: op.undo_group_id,
            created_at,
        };

        let mut state = self.shared.state.lock();
        if state.shutdown {
            // Left unapplied for the next recovery
            tracing::warn!(id, "append after shutdown");
            return Ok(logged);
        }
        state.pending.push(logged.clone());
        state.deadline = Some(Instant::now() + self.shared.debounce);
        self.shared.wake.notify_one();
        tracing::trace!(id, op = %logged.operation_type, entity = %logged.entity_type, "operation appended");
        Ok(logged)
    }

    /// Flush the pending batch now, returning how many operations were applied
    pub fn flush(&self) -> Result<usize> {
        self.shared.flush_batch()
    }

    /// Operations queued in memory and not yet handed to the apply function
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Replay every unapplied operation in log order.
    ///
    /// Meant for startup, before any append. A failure is fatal.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let _serial = self.shared.flush_lock.lock();
        let ops = self.unapplied()?;
        if ops.is_empty() {
            return Ok(RecoveryReport::default());
        }
        tracing::info!(count = ops.len(), "replaying unapplied operations");
        (self.shared.apply)(&ops).map_err(|e| Error::Recovery(Box::new(e)))?;
        let ids: Vec<i64> = ops.iter().map(|op| op.id).collect();
        mark_applied(&self.shared.db, &ids).map_err(|e| Error::Recovery(Box::new(e)))?;
        Ok(RecoveryReport {
            recovered: ids.len(),
        })
    }

    pub fn unapplied(&self) -> Result<Vec<Operation>> {
        let mut conn = self.shared.db.conn()?;
        let rows = operation_log::table
            .filter(operation_log::applied.eq(false))
            .order(operation_log::id.asc())
            .select(OperationRow::as_select())
            .load(&mut conn)
            .context("load unapplied operations")?;
        load(rows)
    }

    pub fn get(&self, id: i64) -> Result<Option<Operation>> {
        let mut conn = self.shared.db.conn()?;
        operation_log::table
            .find(id)
            .select(OperationRow::as_select())
            .first(&mut conn)
            .optional()
            .context("load operation")?
            .map(Operation::try_from)
            .transpose()
    }

    /// Newest applied, not-undone operations first; `None` uses the
    /// configured limit
    pub fn get_undo_operations(&self, limit: Option<usize>) -> Result<Vec<Operation>> {
        let limit = limit.unwrap_or(self.undo_limit);
        let mut conn = self.shared.db.conn()?;
        let rows = operation_log::table
            .filter(operation_log::applied.eq(true))
            .filter(operation_log::is_undone.eq(false))
            .order(operation_log::id.desc())
            .limit(limit as i64)
            .select(OperationRow::as_select())
            .load(&mut conn)
            .context("load undo operations")?;
        load(rows)
    }

    /// Redo candidates, oldest first: undone operations newer than the
    /// newest live one, undone after the last append.
    ///
    /// A fresh mutation after an undo therefore empties the redo stack.
    pub fn get_redo_operations(&self, limit: Option<usize>) -> Result<Vec<Operation>> {
        let limit = limit.unwrap_or(self.undo_limit);
        let mut conn = self.shared.db.conn()?;
        let rows: Vec<OperationRow> = diesel::sql_query(
            "SELECT o.id, o.operation_type, o.entity_type, o.entity_id, o.payload, o.applied, \
             o.is_undone, o.undone_at, o.undo_group_id, o.created_at \
             FROM operation_log o \
             WHERE o.applied = 1 AND o.is_undone = 1 AND o.undone_at IS NOT NULL \
             AND o.id > COALESCE((SELECT MAX(id) FROM operation_log WHERE is_undone = 0), 0) \
             AND NOT EXISTS (SELECT 1 FROM operation_log n WHERE n.created_at > o.undone_at) \
             ORDER BY o.id LIMIT ?",
        )
        .bind::<diesel::sql_types::BigInt, _>(limit as i64)
        .load(&mut conn)
        .context("load redo operations")?;
        load(rows)
    }

    /// Most recent operations in any state, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<Operation>> {
        let mut conn = self.shared.db.conn()?;
        let rows = operation_log::table
            .order(operation_log::id.desc())
            .limit(limit as i64)
            .select(OperationRow::as_select())
            .load(&mut conn)
            .context("load recent operations")?;
        load(rows)
    }

    /// Every operation sharing an undo group, in log order
    pub fn get_group(&self, undo_group_id: &str) -> Result<Vec<Operation>> {
        let mut conn = self.shared.db.conn()?;
        let rows = operation_log::table
            .filter(operation_log::undo_group_id.eq(undo_group_id))
            .order(operation_log::id.asc())
            .select(OperationRow::as_select())
            .load(&mut conn)
            .context("load undo group")?;
        load(rows)
    }

    pub fn mark_undone(&self, id: i64) -> Result<()> {
        self.set_undone(id, true)
    }

    pub fn mark_redone(&self, id: i64) -> Result<()> {
        self.set_undone(id, false)
    }

    /// Only an applied operation can be marked undone; its effect has to
    /// exist before it can be reverted.
    fn set_undone(&self, id: i64, undone: bool) -> Result<()> {
        let mut conn = self.shared.db.conn()?;
        let updated = if undone {
            diesel::update(
                operation_log::table
                    .find(id)
                    .filter(operation_log::applied.eq(true)),
            )
            .set((
                operation_log::is_undone.eq(true),
                operation_log::undone_at.eq(Some(model::now())),
            ))
            .execute(&mut conn)
            .context("update undo flag")?
        } else {
            diesel::update(operation_log::table.find(id))
                .set((
                    operation_log::is_undone.eq(false),
                    operation_log::undone_at.eq(None::<String>),
                ))
                .execute(&mut conn)
                .context("update undo flag")?
        };
        if updated > 0 {
            return Ok(());
        }
        let exists: i64 = operation_log::table
            .find(id)
            .count()
            .get_result(&mut conn)
            .context("look up operation")?;
        if exists == 0 {
            Err(Error::invalid(format!("operation {} does not exist", id)))
        } else {
            Err(Error::invalid(format!("operation {} is not applied yet", id)))
        }
    }

    /// Delete applied, undone operations older than `older_than`
    pub fn cleanup(&self, older_than: chrono::Duration) -> Result<usize> {
        let cutoff = model::format_ts(chrono::Utc::now() - older_than);
        let mut conn = self.shared.db.conn()?;
        let removed = diesel::delete(
            operation_log::table
                .filter(operation_log::applied.eq(true))
                .filter(operation_log::is_undone.eq(true))
                .filter(operation_log::created_at.lt(&cutoff)),
        )
        .execute(&mut conn)
        .context("clean up operation log")?;
        if removed > 0 {
            tracing::info!(removed, "operation log cleaned up");
        }
        Ok(removed)
    }

    /// Stop the flusher after a final flush. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                tracing::error!("WAL flusher thread panicked");
            }
        }
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.shutdown();
    }
}
