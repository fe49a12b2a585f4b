//! Storage engine facade
//!
//! Ties the two tree stores to the write-ahead log. Every mutation runs the
//! store operation, snapshots the node before and after, and appends the
//! matching [`Operation`]. Undo and redo read the log back.

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::model::{self, NewTodo, NewWorkspace, Todo, TreeKind, Workspace, SYSTEM_PREFIX};
use crate::repair::{IntegrityReport, Repairer};
use crate::replay::Replayer;
use crate::store::{DeleteRecord, DeletedNode, TodoStore, TreeNode, TreeStore, WorkspaceStore};
use crate::wal::{NewOperation, Operation, OperationType, Wal};
use parking_lot::Mutex;
use std::cmp::Reverse;
use uuid::Uuid;

/// What `Engine::open` did before handing control back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub repaired: Vec<(TreeKind, IntegrityReport)>,
    pub recovered: usize,
    pub auto_archived: usize,
}

pub struct Engine {
    config: Config,
    db: Database,
    workspaces: WorkspaceStore,
    todos: TodoStore,
    replayer: Replayer,
    repairer: Repairer,
    wal: Wal,
    group: Mutex<Option<String>>,
    startup: StartupReport,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("db", &self.db)
            .field("wal", &self.wal)
            .field("startup", &self.startup)
            .finish()
    }
}

impl Engine {
    /// Open the configured database and bring it to a consistent state
    pub fn open(config: Config) -> Result<Self> {
        let db = Database::open(config.database.path.as_deref())?;
        Self::with_database(db, config)
    }

    /// Startup sequence: repair, recover the log, auto-archive.
    ///
    /// A recovery failure aborts with [`Error::Recovery`].
    pub fn with_database(db: Database, config: Config) -> Result<Self> {
        let repairer = Repairer::new(db.clone());
        let repaired = repairer.repair_all()?;

        let workspaces = WorkspaceStore::new(db.clone());
        let todos = TodoStore::new(db.clone());
        let replayer = Replayer::new(db.clone());
        let wal = Wal::open(db.clone(), config.wal_config(), replayer.clone().into_apply_fn())?;

        let recovered = wal.recover()?.recovered;
        if recovered > 0 {
            tracing::info!(recovered, "recovered unapplied operations");
        }

        workspaces.get_or_create_archive()?;
        let auto_archived = match config.auto_archive_after() {
            Some(age) => todos.auto_archive(age)?,
            None => 0,
        };

        Ok(Self {
            config,
            db,
            workspaces,
            todos,
            replayer,
            repairer,
            wal,
            group: Mutex::new(None),
            startup: StartupReport {
                repaired,
                recovered,
                auto_archived,
            },
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn workspaces(&self) -> &WorkspaceStore {
        &self.workspaces
    }

    pub fn todos(&self) -> &TodoStore {
        &self.todos
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn startup(&self) -> &StartupReport {
        &self.startup
    }

    /// Run `f` with every appended operation in one undo group
    pub fn batch<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let _scope = GroupScope::enter(&self.group);
        f(self)
    }

    fn log(&self, op: NewOperation) -> Result<Operation> {
        let op = match self.group.lock().clone() {
            Some(group) => op.in_group(group),
            None => op,
        };
        self.wal.append(op)
    }

    fn log_change<N: TreeNode>(&self, ty: OperationType, before: &N, after: &N) -> Result<()> {
        self.log(NewOperation::changed(ty, before, after)?)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Generic tree mutations
    // ------------------------------------------------------------------

    fn reparent<S: TreeStore>(&self, store: &S, id: &str, parent: Option<&str>) -> Result<S::Node> {
        let before = store.get(id)?;
        let after = store.move_to(id, parent)?;
        self.log_change(OperationType::Move, &before, &after)?;
        Ok(after)
    }

    fn reposition<S: TreeStore>(&self, store: &S, id: &str, position: i32) -> Result<S::Node> {
        let before = store.get(id)?;
        let after = store.reorder(id, position)?;
        self.log_change(OperationType::Update, &before, &after)?;
        Ok(after)
    }

    fn remove<S: TreeStore>(&self, store: &S, id: &str) -> Result<Vec<String>> {
        let before = store.get(id)?;
        let mut nodes = vec![DeletedNode {
            id: id.to_string(),
            parent_id: before.parent_id().map(str::to_string),
        }];
        nodes.extend(store.descendants(id)?.into_iter().map(|r| DeletedNode {
            id: r.node.id().to_string(),
            parent_id: r.node.parent_id().map(str::to_string),
        }));
        let record = DeleteRecord {
            stamp: model::now(),
            nodes,
        };
        let ids = store.delete_stamped(id, &record.stamp)?;
        self.log(NewOperation::deleted(&before, &record)?)?;
        Ok(ids)
    }

    /// Move under the previous sibling
    fn indent<S: TreeStore>(&self, store: &S, id: &str) -> Result<S::Node> {
        let node = store.get(id)?;
        let siblings = store.siblings(&node)?;
        let index = siblings
            .iter()
            .position(|s| s.id() == id)
            .ok_or_else(|| Error::not_found(store.kind(), id))?;
        if index == 0 {
            return Err(Error::invalid("no sibling above"));
        }
        let parent = siblings[index - 1].id().to_string();
        self.reparent(store, id, Some(&parent))
    }

    /// Move next to the current parent
    fn outdent<S: TreeStore>(&self, store: &S, id: &str) -> Result<S::Node> {
        let node = store.get(id)?;
        let parent_id = node.parent_id().ok_or_else(|| Error::invalid("no parent"))?;
        let parent = store.get(parent_id)?;
        let grandparent = parent.parent_id().map(str::to_string);
        self.reparent(store, id, grandparent.as_deref())
    }

    fn shift<S: TreeStore>(&self, store: &S, id: &str, delta: i32) -> Result<S::Node> {
        let node = store.get(id)?;
        if delta < 0 && node.position() <= 0 {
            return Err(Error::invalid("already at top"));
        }
        let position = node
            .position()
            .checked_add(delta)
            .ok_or_else(|| Error::invalid("already at bottom"))?;
        self.reposition(store, id, position)
    }

    // ------------------------------------------------------------------
    // Workspaces
    // ------------------------------------------------------------------

    fn ensure_user_workspace(&self, id: &str) -> Result<Workspace> {
        let ws = self.workspaces.get(id)?;
        if ws.is_system() {
            return Err(Error::invalid(format!("workspace '{}' is managed by lazytodo", ws.name)));
        }
        Ok(ws)
    }

    /// System workspaces hold no user workspaces
    fn ensure_user_parent(&self, parent: Option<&str>) -> Result<()> {
        match parent {
            Some(id) => self.ensure_user_workspace(id).map(|_| ()),
            None => Ok(()),
        }
    }

    pub fn create_workspace(&self, new: NewWorkspace) -> Result<Workspace> {
        if new.name.starts_with(SYSTEM_PREFIX) {
            return Err(Error::invalid(format!(
                "workspace names starting with '{}' are reserved",
                SYSTEM_PREFIX
            )));
        }
        self.ensure_user_parent(new.parent_id.as_deref())?;
        let ws = self.workspaces.create(new)?;
        self.log(NewOperation::created(&ws)?)?;
        Ok(ws)
    }

    pub fn rename_workspace(&self, id: &str, name: &str) -> Result<Workspace> {
        let before = self.ensure_user_workspace(id)?;
        let after = self.workspaces.rename(id, name)?;
        self.log_change(OperationType::Update, &before, &after)?;
        Ok(after)
    }

    pub fn toggle_workspace(&self, id: &str) -> Result<Workspace> {
        let before = self.workspaces.get(id)?;
        let after = self.workspaces.toggle_expanded(id)?;
        self.log_change(OperationType::Update, &before, &after)?;
        Ok(after)
    }

    pub fn move_workspace(&self, id: &str, parent: Option<&str>) -> Result<Workspace> {
        self.ensure_user_workspace(id)?;
        self.ensure_user_parent(parent)?;
        self.reparent(&self.workspaces, id, parent)
    }

    pub fn reorder_workspace(&self, id: &str, position: i32) -> Result<Workspace> {
        self.ensure_user_workspace(id)?;
        self.reposition(&self.workspaces, id, position)
    }

    pub fn delete_workspace(&self, id: &str) -> Result<Vec<String>> {
        self.ensure_user_workspace(id)?;
        self.remove(&self.workspaces, id)
    }

    pub fn indent_workspace(&self, id: &str) -> Result<Workspace> {
        let ws = self.ensure_user_workspace(id)?;
        let siblings = self.workspaces.siblings(&ws)?;
        if let Some(index) = siblings.iter().position(|s| s.id == ws.id) {
            if index > 0 && siblings[index - 1].is_system() {
                return Err(Error::invalid(format!(
                    "workspace '{}' is managed by lazytodo",
                    siblings[index - 1].name
                )));
            }
        }
        self.indent(&self.workspaces, id)
    }

    pub fn outdent_workspace(&self, id: &str) -> Result<Workspace> {
        self.ensure_user_workspace(id)?;
        self.outdent(&self.workspaces, id)
    }

    pub fn workspace_up(&self, id: &str) -> Result<Workspace> {
        self.ensure_user_workspace(id)?;
        self.shift(&self.workspaces, id, -1)
    }

    pub fn workspace_down(&self, id: &str) -> Result<Workspace> {
        self.ensure_user_workspace(id)?;
        self.shift(&self.workspaces, id, 1)
    }

    // ------------------------------------------------------------------
    // Todos
    // ------------------------------------------------------------------

    pub fn create_todo(&self, new: NewTodo) -> Result<Todo> {
        let todo = self.todos.create(new)?;
        self.log(NewOperation::created(&todo)?)?;
        Ok(todo)
    }

    pub fn update_todo(&self, todo: &Todo) -> Result<Todo> {
        let before = self.todos.get(&todo.id)?;
        let after = self.todos.update(todo)?;
        self.log_change(OperationType::Update, &before, &after)?;
        Ok(after)
    }

    pub fn toggle_todo(&self, id: &str) -> Result<Todo> {
        let before = self.todos.get(id)?;
        let after = self.todos.toggle_status(id)?;
        self.log_change(OperationType::Update, &before, &after)?;
        Ok(after)
    }

    pub fn archive_todo(&self, id: &str) -> Result<Todo> {
        let before = self.todos.get(id)?;
        let after = self.todos.archive(id)?;
        self.log_change(OperationType::Update, &before, &after)?;
        Ok(after)
    }

    /// Reparent a todo, optionally moving its subtree to another workspace
    pub fn move_todo(&self, id: &str, parent: Option<&str>, workspace: Option<&str>) -> Result<Todo> {
        let before = self.todos.get(id)?;
        let after = self.todos.move_to_workspace(id, parent, workspace)?;
        self.log_change(OperationType::Move, &before, &after)?;
        Ok(after)
    }

    pub fn reorder_todo(&self, id: &str, position: i32) -> Result<Todo> {
        self.reposition(&self.todos, id, position)
    }

    pub fn delete_todo(&self, id: &str) -> Result<Vec<String>> {
        self.remove(&self.todos, id)
    }

    pub fn indent_todo(&self, id: &str) -> Result<Todo> {
        self.indent(&self.todos, id)
    }

    pub fn outdent_todo(&self, id: &str) -> Result<Todo> {
        self.outdent(&self.todos, id)
    }

    pub fn todo_up(&self, id: &str) -> Result<Todo> {
        self.shift(&self.todos, id, -1)
    }

    pub fn todo_down(&self, id: &str) -> Result<Todo> {
        self.shift(&self.todos, id, 1)
    }

    // ------------------------------------------------------------------
    // History and maintenance
    // ------------------------------------------------------------------

    /// Revert the newest change (and the rest of its undo group).
    ///
    /// Returns the reverted operations, newest first; empty when there is
    /// nothing to undo.
    pub fn undo(&self) -> Result<Vec<Operation>> {
        self.wal.flush()?;
        let Some(top) = self.wal.get_undo_operations(Some(1))?.into_iter().next() else {
            return Ok(Vec::new());
        };
        let mut ops = match top.undo_group_id.as_deref() {
            Some(group) => self
                .wal
                .get_group(group)?
                .into_iter()
                .filter(|op| op.applied && !op.is_undone)
                .collect(),
            None => vec![top],
        };
        ops.sort_by_key(|op| Reverse(op.id));
        for op in &ops {
            self.replayer.revert(op)?;
            self.wal.mark_undone(op.id)?;
        }
        tracing::debug!(count = ops.len(), "undone");
        Ok(ops)
    }

    /// Re-apply the oldest undone change (and the rest of its undo group).
    ///
    /// Returns the re-applied operations, oldest first.
    pub fn redo(&self) -> Result<Vec<Operation>> {
        self.wal.flush()?;
        let Some(first) = self.wal.get_redo_operations(Some(1))?.into_iter().next() else {
            return Ok(Vec::new());
        };
        let mut ops = match first.undo_group_id.as_deref() {
            Some(group) => self
                .wal
                .get_group(group)?
                .into_iter()
                .filter(|op| op.is_undone)
                .collect(),
            None => vec![first],
        };
        ops.sort_by_key(|op| op.id);
        for op in &ops {
            self.replayer.reapply(op)?;
            self.wal.mark_redone(op.id)?;
        }
        tracing::debug!(count = ops.len(), "redone");
        Ok(ops)
    }

    pub fn history(&self, limit: usize) -> Result<Vec<Operation>> {
        self.wal.recent(limit)
    }

    pub fn repair(&self) -> Result<Vec<(TreeKind, IntegrityReport)>> {
        self.wal.flush()?;
        self.repairer.repair_all()
    }

    pub fn check(&self) -> Result<Vec<(TreeKind, IntegrityReport)>> {
        TreeKind::all()
            .into_iter()
            .map(|kind| Ok((kind, self.repairer.check(kind)?)))
            .collect()
    }

    /// Drop undone operations older than `older_than` (the configured
    /// retention when `None`)
    pub fn gc(&self, older_than: Option<chrono::Duration>) -> Result<usize> {
        self.wal.cleanup(older_than.unwrap_or_else(|| self.config.retention()))
    }

    /// Flush pending operations and stop the log
    pub fn close(self) -> Result<()> {
        let flushed = self.wal.flush();
        self.wal.shutdown();
        flushed.map(|_| ())
    }
}

/// Holds the current undo group for the length of a batch.
///
/// Nested batches join the outermost group. The owner clears it on drop,
/// which also covers a panic inside the batch.
struct GroupScope<'a> {
    group: &'a Mutex<Option<String>>,
    owns: bool,
}

impl<'a> GroupScope<'a> {
    fn enter(group: &'a Mutex<Option<String>>) -> Self {
        let mut current = group.lock();
        let owns = current.is_none();
        if owns {
            *current = Some(Uuid::new_v4().to_string());
        }
        Self { group, owns }
    }
}

impl Drop for GroupScope<'_> {
    fn drop(&mut self) {
        if self.owns {
            *self.group.lock() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Engine,
    }

    fn config() -> Config {
        let mut config = Config::default();
        // Only explicit flushes in tests
        config.wal.debounce_ms = 60_000;
        config
    }

    fn fixture() -> Fixture {
        let (dir, db) = crate::db::test_db();
        let engine = Engine::with_database(db, config()).unwrap();
        Fixture { _dir: dir, engine }
    }

    fn names(ws: &[Workspace]) -> Vec<&str> {
        ws.iter().map(|w| w.name.as_str()).collect()
    }

    #[test]
    fn test_example_scenario_is_logged() {
        let f = fixture();
        let e = &f.engine;
        let w1 = e.create_workspace(NewWorkspace::named("W1")).unwrap();
        let w2 = e.create_workspace(NewWorkspace::named("W2").under(&w1.id)).unwrap();
        assert_eq!(w2.depth, 1);
        assert_eq!(w2.parent_id.as_deref(), Some(w1.id.as_str()));

        let w2 = e.move_workspace(&w2.id, None).unwrap();
        assert_eq!(w2.depth, 0);
        e.delete_workspace(&w1.id).unwrap();
        assert!(e.workspaces().get(&w2.id).is_ok());

        let ops = e.history(10).unwrap();
        let kinds: Vec<OperationType> = ops.iter().map(|o| o.operation_type).collect();
        assert_eq!(
            kinds,
            vec![
                OperationType::Delete,
                OperationType::Move,
                OperationType::Create,
                OperationType::Create
            ]
        );
        assert_eq!(e.wal().pending_len(), 4);
    }

    #[test]
    fn test_system_workspace_is_protected() {
        let f = fixture();
        let e = &f.engine;
        let archive = e.workspaces().get_or_create_archive().unwrap();
        let protected = |r: Result<Workspace>| matches!(r, Err(Error::InvalidOperation(_)));
        assert!(protected(e.rename_workspace(&archive.id, "x")));
        assert!(e.delete_workspace(&archive.id).is_err());
        assert!(e.create_workspace(NewWorkspace::named("_mine")).is_err());

        // Its position is fixed
        assert!(protected(e.workspace_up(&archive.id)));
        assert!(protected(e.workspace_down(&archive.id)));
        assert!(protected(e.reorder_workspace(&archive.id, 0)));
        assert!(protected(e.outdent_workspace(&archive.id)));

        // And it never becomes a parent
        let ws = e.create_workspace(NewWorkspace::named("Work")).unwrap();
        assert!(protected(e.move_workspace(&ws.id, Some(&archive.id))));
        assert!(protected(e.create_workspace(NewWorkspace::named("Nested").under(&archive.id))));

        // Indenting the workspace right below it would nest under it
        let below = e
            .create_workspace(NewWorkspace::named("Below").at(model::ARCHIVE_POSITION + 1))
            .unwrap();
        assert!(protected(e.indent_workspace(&below.id)));

        assert!(e.workspaces().children(&archive.id).unwrap().is_empty());
        let archive_now = e.workspaces().get(&archive.id).unwrap();
        assert_eq!(archive_now.position, model::ARCHIVE_POSITION);
        assert_eq!(archive_now.parent_id, None);
    }

    #[test]
    fn test_shift_stops_at_both_ends() {
        let f = fixture();
        let e = &f.engine;
        let ws = e.create_workspace(NewWorkspace::named("Edge").at(i32::MAX)).unwrap();
        assert!(matches!(e.workspace_down(&ws.id), Err(Error::InvalidOperation(m)) if m == "already at bottom"));
        assert_eq!(e.workspaces().get(&ws.id).unwrap().position, i32::MAX);
        assert_eq!(e.workspace_up(&ws.id).unwrap().position, i32::MAX - 1);

        let top = e.create_todo(NewTodo::new(&ws.id, "top").at(0)).unwrap();
        assert!(matches!(e.todo_up(&top.id), Err(Error::InvalidOperation(m)) if m == "already at top"));
        let last = e.create_todo(NewTodo::new(&ws.id, "last").at(i32::MAX)).unwrap();
        assert!(matches!(e.todo_down(&last.id), Err(Error::InvalidOperation(m)) if m == "already at bottom"));
        assert_eq!(e.todos().get(&last.id).unwrap().position, i32::MAX);
    }

    #[test]
    fn test_batch_panic_releases_undo_group() {
        let f = fixture();
        let e = &f.engine;
        let ws = e.create_workspace(NewWorkspace::named("Inbox")).unwrap();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            e.batch(|e| -> Result<()> {
                e.create_todo(NewTodo::new(&ws.id, "grouped"))?;
                panic!("batch body failed");
            })
        }));
        assert!(outcome.is_err());

        e.create_todo(NewTodo::new(&ws.id, "alone")).unwrap();
        let history = e.history(2).unwrap();
        assert_eq!(history[0].undo_group_id, None);
        assert!(history[1].undo_group_id.is_some());
    }

    #[test]
    fn test_indent_and_outdent() {
        let f = fixture();
        let e = &f.engine;
        let ws = e.create_workspace(NewWorkspace::named("Inbox")).unwrap();
        let a = e.create_todo(NewTodo::new(&ws.id, "a").at(0)).unwrap();
        let b = e.create_todo(NewTodo::new(&ws.id, "b").at(1)).unwrap();

        assert!(matches!(e.indent_todo(&a.id), Err(Error::InvalidOperation(m)) if m == "no sibling above"));
        let b = e.indent_todo(&b.id).unwrap();
        assert_eq!(b.parent_id.as_deref(), Some(a.id.as_str()));
        assert_eq!(b.depth, 1);

        let b = e.outdent_todo(&b.id).unwrap();
        assert_eq!(b.parent_id, None);
        assert!(matches!(e.outdent_todo(&b.id), Err(Error::InvalidOperation(m)) if m == "no parent"));
    }

    #[test]
    fn test_move_up_and_down() {
        let f = fixture();
        let ws = f.engine.create_workspace(NewWorkspace::named("Inbox")).unwrap();
        assert!(f.engine.workspace_up(&ws.id).is_err());
        let ws = f.engine.workspace_down(&ws.id).unwrap();
        assert_eq!(ws.position, 1);
        assert_eq!(f.engine.workspace_up(&ws.id).unwrap().position, 0);
    }

    #[test]
    fn test_undo_create_and_redo() {
        let f = fixture();
        let e = &f.engine;
        let ws = e.create_workspace(NewWorkspace::named("Inbox")).unwrap();
        let undone = e.undo().unwrap();
        assert_eq!(undone.len(), 1);
        assert!(e.workspaces().get(&ws.id).is_err());

        let redone = e.redo().unwrap();
        assert_eq!(redone[0].id, undone[0].id);
        assert_eq!(e.workspaces().get(&ws.id).unwrap().name, "Inbox");
        assert!(e.redo().unwrap().is_empty());
    }

    #[test]
    fn test_undo_delete_restores_subtree() {
        let f = fixture();
        let e = &f.engine;
        let ws = e.create_workspace(NewWorkspace::named("Inbox")).unwrap();
        let root = e.create_todo(NewTodo::new(&ws.id, "root")).unwrap();
        let child = e.create_todo(NewTodo::new(&ws.id, "child").under(&root.id)).unwrap();
        e.delete_todo(&root.id).unwrap();
        e.wal().flush().unwrap();
        // Pruned closure rows must not block the undo
        e.repair().unwrap();

        e.undo().unwrap();
        let child = e.todos().get(&child.id).unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(child.depth, 1);
    }

    #[test]
    fn test_undo_rename_then_redo() {
        let f = fixture();
        let e = &f.engine;
        let ws = e.create_workspace(NewWorkspace::named("old")).unwrap();
        e.rename_workspace(&ws.id, "new").unwrap();

        e.undo().unwrap();
        assert_eq!(e.workspaces().get(&ws.id).unwrap().name, "old");
        e.redo().unwrap();
        assert_eq!(e.workspaces().get(&ws.id).unwrap().name, "new");
    }

    #[test]
    fn test_new_change_discards_redo() {
        let f = fixture();
        let e = &f.engine;
        let ws = e.create_workspace(NewWorkspace::named("a")).unwrap();
        e.rename_workspace(&ws.id, "b").unwrap();
        e.undo().unwrap();
        e.rename_workspace(&ws.id, "c").unwrap();
        e.undo().unwrap();

        // Only the latest undo is redoable
        let redone = e.redo().unwrap();
        assert_eq!(redone.len(), 1);
        assert_eq!(e.workspaces().get(&ws.id).unwrap().name, "c");
        assert!(e.redo().unwrap().is_empty());
    }

    #[test]
    fn test_batch_undoes_as_one() {
        let f = fixture();
        let e = &f.engine;
        let ws = e.create_workspace(NewWorkspace::named("Inbox")).unwrap();
        let ids: Vec<String> = e
            .batch(|e| {
                (0..3)
                    .map(|i| e.create_todo(NewTodo::new(&ws.id, format!("t{}", i))).map(|t| t.id))
                    .collect()
            })
            .unwrap();

        assert_eq!(e.undo().unwrap().len(), 3);
        for id in &ids {
            assert!(e.todos().get(id).is_err());
        }
        assert_eq!(e.redo().unwrap().len(), 3);
        assert_eq!(e.todos().list_by_workspace(&ws.id, false).unwrap().len(), 3);
    }

    #[test]
    fn test_reopen_recovers_unapplied_tail() {
        let (dir, db) = crate::db::test_db();
        let engine = Engine::with_database(db.clone(), config()).unwrap();
        let ws = engine.create_workspace(NewWorkspace::named("Inbox")).unwrap();
        // Crash before the debounced flush
        std::mem::forget(engine);

        let engine = Engine::with_database(db, config()).unwrap();
        assert_eq!(engine.startup().recovered, 1);
        assert!(engine.wal().unapplied().unwrap().is_empty());
        assert_eq!(
            names(&engine.workspaces().list_all().unwrap()),
            vec!["Inbox", model::ARCHIVE_WORKSPACE]
        );
        assert_eq!(engine.workspaces().get(&ws.id).unwrap().name, "Inbox");
        engine.close().unwrap();
        drop(dir);
    }

    #[test]
    fn test_background_flush_applies_ops() {
        let (_dir, db) = crate::db::test_db();
        let mut config = Config::default();
        config.wal.debounce_ms = 20;
        let engine = Engine::with_database(db, config).unwrap();
        engine.create_workspace(NewWorkspace::named("Inbox")).unwrap();
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(engine.wal().pending_len(), 0);
        assert!(engine.wal().unapplied().unwrap().is_empty());
    }
}
