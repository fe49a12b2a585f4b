//! Applying logged operations to the entity tables
//!
//! [`Replayer::apply`] is the WAL's apply function. Every operation is
//! replayed from its snapshots with last-writer-wins on `updated_at`, so a
//! batch whose effects are already in the tables changes nothing, and an
//! older snapshot never overwrites a newer row.
//!
//! [`Replayer::revert`] and [`Replayer::reapply`] are the forced forms used by
//! undo and redo: they restamp the snapshot so it wins.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::model::{self, TreeKind};
use crate::store::{DeleteRecord, TodoStore, TreeNode, TreeStore, WorkspaceStore};
use crate::wal::{ApplyFn, Operation, OperationType};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Replayer {
    workspaces: WorkspaceStore,
    todos: TodoStore,
}

impl Replayer {
    pub fn new(db: Database) -> Self {
        Self {
            workspaces: WorkspaceStore::new(db.clone()),
            todos: TodoStore::new(db),
        }
    }

    /// Wrap this replayer as a WAL apply function
    pub fn into_apply_fn(self) -> ApplyFn {
        Arc::new(move |ops: &[Operation]| self.apply(ops))
    }

    /// Replay a batch in log order
    pub fn apply(&self, ops: &[Operation]) -> Result<()> {
        for op in ops {
            let result = match op.entity_type {
                TreeKind::Workspace => replay(&self.workspaces, op),
                TreeKind::Todo => replay(&self.todos, op),
            };
            if let Err(e) = result {
                tracing::warn!(id = op.id, op = %op.operation_type, entity = %op.entity_id, error = %e, "replay failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Write the inverse of `op`
    pub fn revert(&self, op: &Operation) -> Result<()> {
        match op.entity_type {
            TreeKind::Workspace => revert(&self.workspaces, op),
            TreeKind::Todo => revert(&self.todos, op),
        }
    }

    /// Write `op` forward again after it was reverted
    pub fn reapply(&self, op: &Operation) -> Result<()> {
        match op.entity_type {
            TreeKind::Workspace => reapply(&self.workspaces, op),
            TreeKind::Todo => reapply(&self.todos, op),
        }
    }
}

fn snapshot<N: TreeNode>(op: &Operation, after: bool) -> Result<N> {
    let node = if after {
        op.payload.after_as::<N>()?
    } else {
        op.payload.before_as::<N>()?
    };
    node.ok_or_else(|| {
        Error::IntegrityViolation(format!(
            "{} operation {} has no {} snapshot",
            op.operation_type,
            op.id,
            if after { "after" } else { "before" }
        ))
    })
}

fn delete_record(op: &Operation) -> Result<DeleteRecord> {
    op.payload.extra_as::<DeleteRecord>()?.ok_or_else(|| {
        Error::IntegrityViolation(format!("delete operation {} has no cascade record", op.id))
    })
}

fn replay<S: TreeStore>(store: &S, op: &Operation) -> Result<()> {
    match op.operation_type {
        OperationType::Create | OperationType::Update | OperationType::Move => {
            let after: S::Node = snapshot(op, true)?;
            store.restore(&after)?;
        }
        OperationType::Delete => {
            let record = delete_record(op)?;
            match store.find(&op.entity_id)? {
                Some(current)
                    if current.deleted_at().is_none()
                        && current.updated_at() <= record.stamp.as_str() =>
                {
                    store.delete_stamped(&op.entity_id, &record.stamp)?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn revert<S: TreeStore>(store: &S, op: &Operation) -> Result<()> {
    match op.operation_type {
        OperationType::Create => match store.delete(&op.entity_id) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        },
        OperationType::Delete => {
            let record = delete_record(op)?;
            store.undelete(&record.nodes, &record.stamp)?;
            Ok(())
        }
        OperationType::Update | OperationType::Move => {
            let mut before: S::Node = snapshot(op, false)?;
            before.touch(model::now());
            store.restore(&before)?;
            Ok(())
        }
    }
}

fn reapply<S: TreeStore>(store: &S, op: &Operation) -> Result<()> {
    match op.operation_type {
        OperationType::Delete => {
            let record = delete_record(op)?;
            match store.delete_stamped(&op.entity_id, &record.stamp) {
                Err(e) if e.is_not_found() => Ok(()),
                other => other.map(|_| ()),
            }
        }
        _ => {
            let mut after: S::Node = snapshot(op, true)?;
            after.touch(model::now());
            store.restore(&after)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::model::{NewWorkspace, Workspace};
    use crate::store::DeletedNode;
    use crate::wal::NewOperation;

    fn logged(op: NewOperation, id: i64) -> Operation {
        Operation {
            id,
            operation_type: op.operation_type,
            entity_type: op.entity_type,
            entity_id: op.entity_id,
            payload: op.payload,
            applied: false,
            is_undone: false,
            undone_at: None,
            undo_group_id: op.undo_group_id,
            created_at: model::now(),
        }
    }

    #[test]
    fn test_replay_recreates_missing_subtree() {
        let (_dir, db) = test_db();
        let source_dir = tempfile::TempDir::new().unwrap();
        let source = WorkspaceStore::new(Database::open_at(source_dir.path().join("src.db")).unwrap());
        let a = source.create(NewWorkspace::named("a")).unwrap();
        let b = source.create(NewWorkspace::named("b").under(&a.id)).unwrap();

        let ops = vec![
            logged(NewOperation::created(&a).unwrap(), 1),
            logged(NewOperation::created(&b).unwrap(), 2),
        ];
        let replayer = Replayer::new(db.clone());
        replayer.apply(&ops).unwrap();
        // Replaying twice is a no-op
        replayer.apply(&ops).unwrap();

        let target = WorkspaceStore::new(db);
        let b2 = target.get(&b.id).unwrap();
        assert_eq!(b2.parent_id.as_deref(), Some(a.id.as_str()));
        assert_eq!(b2.depth, 1);
        assert_eq!(target.list_all().unwrap().len(), 2);
    }

    #[test]
    fn test_stale_update_does_not_clobber() {
        let (_dir, db) = test_db();
        let store = WorkspaceStore::new(db.clone());
        let ws = store.create(NewWorkspace::named("old")).unwrap();
        let renamed = store.rename(&ws.id, "new").unwrap();

        let stale = logged(NewOperation::changed(OperationType::Update, &renamed, &ws).unwrap(), 1);
        Replayer::new(db).apply(&[stale]).unwrap();
        assert_eq!(store.get(&ws.id).unwrap().name, "new");
    }

    #[test]
    fn test_revert_and_reapply_move() {
        let (_dir, db) = test_db();
        let store = WorkspaceStore::new(db.clone());
        let a = store.create(NewWorkspace::named("a")).unwrap();
        let b = store.create(NewWorkspace::named("b")).unwrap();
        let moved = store.move_to(&b.id, Some(&a.id)).unwrap();

        let op = logged(NewOperation::changed(OperationType::Move, &b, &moved).unwrap(), 1);
        let replayer = Replayer::new(db);
        replayer.revert(&op).unwrap();
        let back: Workspace = store.get(&b.id).unwrap();
        assert_eq!(back.parent_id, None);
        assert_eq!(back.depth, 0);

        replayer.reapply(&op).unwrap();
        assert_eq!(store.get(&b.id).unwrap().parent_id.as_deref(), Some(a.id.as_str()));
    }

    #[test]
    fn test_delete_replay_uses_recorded_stamp() {
        let (_dir, db) = test_db();
        let store = WorkspaceStore::new(db.clone());
        let a = store.create(NewWorkspace::named("a")).unwrap();
        let b = store.create(NewWorkspace::named("b").under(&a.id)).unwrap();

        let record = DeleteRecord {
            stamp: model::now(),
            nodes: vec![
                DeletedNode { id: a.id.clone(), parent_id: None },
                DeletedNode { id: b.id.clone(), parent_id: Some(a.id.clone()) },
            ],
        };
        let op = logged(NewOperation::deleted(&a, &record).unwrap(), 1);
        let replayer = Replayer::new(db);
        replayer.apply(std::slice::from_ref(&op)).unwrap();
        assert_eq!(
            store.find(&b.id).unwrap().unwrap().deleted_at.as_deref(),
            Some(record.stamp.as_str())
        );

        replayer.revert(&op).unwrap();
        assert_eq!(store.get(&b.id).unwrap().depth, 1);
    }
}
