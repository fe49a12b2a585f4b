//! Property tests for the closure tables.
//!
//! Random create/move/delete/repair sequences are mirrored in a plain parent
//! map. Between repairs the stored rows between live nodes must equal the
//! closure computed from that map; right after a repair nothing else may be
//! left. The todo tree additionally tracks workspace membership, which a
//! move cascades to the whole subtree.

use std::collections::{BTreeSet, HashMap, HashSet};

use lazytodo::{
    ClosureTable, Database, Error, NewTodo, NewWorkspace, Repairer, TodoStore, TreeKind, TreeStore,
    WorkspaceStore,
};
use proptest::prelude::*;
use proptest::sample::Index;

type Closure = BTreeSet<(String, String, i32)>;

fn config() -> ProptestConfig {
    ProptestConfig {
        cases: 32,
        max_shrink_iters: 256,
        ..ProptestConfig::default()
    }
}

#[derive(Debug, Clone)]
enum Step {
    Create { parent: Option<Index> },
    Move { node: Index, parent: Option<Index> },
    Delete { node: Index },
    Repair,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => proptest::option::of(any::<Index>()).prop_map(|parent| Step::Create { parent }),
        3 => (any::<Index>(), proptest::option::of(any::<Index>()))
            .prop_map(|(node, parent)| Step::Move { node, parent }),
        1 => any::<Index>().prop_map(|node| Step::Delete { node }),
        1 => Just(Step::Repair),
    ]
}

#[derive(Debug, Clone)]
enum TodoStep {
    Create { parent: Option<Index>, second: bool },
    Move { node: Index, parent: Option<Index>, workspace: Option<bool> },
}

fn todo_step_strategy() -> impl Strategy<Value = TodoStep> {
    prop_oneof![
        3 => (proptest::option::of(any::<Index>()), any::<bool>())
            .prop_map(|(parent, second)| TodoStep::Create { parent, second }),
        3 => (
            any::<Index>(),
            proptest::option::of(any::<Index>()),
            proptest::option::of(any::<bool>())
        )
            .prop_map(|(node, parent, workspace)| TodoStep::Move { node, parent, workspace }),
    ]
}

/// Parent map kept alongside the store
#[derive(Default)]
struct Model {
    ids: Vec<String>,
    parent: HashMap<String, Option<String>>,
    deleted: HashSet<String>,
}

impl Model {
    fn add(&mut self, id: String, parent: Option<String>) {
        self.parent.insert(id.clone(), parent);
        self.ids.push(id);
    }

    fn live(&self) -> Vec<String> {
        self.ids.iter().filter(|id| !self.deleted.contains(*id)).cloned().collect()
    }

    fn ancestors(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut cur = self.parent.get(id).cloned().flatten();
        while let Some(p) = cur {
            cur = self.parent.get(&p).cloned().flatten();
            out.push(p);
        }
        out
    }

    /// `id` and every live node below it
    fn subtree(&self, id: &str) -> BTreeSet<String> {
        self.live()
            .into_iter()
            .filter(|n| n == id || self.ancestors(n).iter().any(|a| a == id))
            .collect()
    }

    fn would_cycle(&self, node: &str, parent: &str) -> bool {
        node == parent || self.ancestors(parent).iter().any(|a| a == node)
    }

    fn closure(&self) -> Closure {
        let mut rows = BTreeSet::new();
        for id in self.live() {
            rows.insert((id.clone(), id.clone(), 0));
            for (i, anc) in self.ancestors(&id).into_iter().enumerate() {
                rows.insert((anc, id.clone(), i as i32 + 1));
            }
        }
        rows
    }
}

fn pick(index: &Index, ids: &[String]) -> Option<String> {
    (!ids.is_empty()).then(|| index.get(ids).clone())
}

fn stored_closure(db: &Database, closure: ClosureTable) -> Closure {
    let mut conn = db.conn().unwrap();
    closure
        .rows(&mut conn)
        .unwrap()
        .into_iter()
        .map(|r| (r.ancestor_id, r.descendant_id, r.depth))
        .collect()
}

/// Stored rows whose endpoints are both live
fn live_closure(db: &Database, closure: ClosureTable, model: &Model) -> Closure {
    let live: HashSet<String> = model.live().into_iter().collect();
    stored_closure(db, closure)
        .into_iter()
        .filter(|(a, d, _)| live.contains(a) && live.contains(d))
        .collect()
}

fn run(steps: &[Step]) -> Result<(), TestCaseError> {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::open_at(dir.path().join("props.db")).unwrap();
    let store = WorkspaceStore::new(db.clone());
    let repairer = Repairer::new(db.clone());
    let mut model = Model::default();

    for (n, step) in steps.iter().enumerate() {
        let live = model.live();
        match step {
            Step::Create { parent } => {
                let parent = parent.as_ref().and_then(|i| pick(i, &live));
                let mut new = NewWorkspace::named(format!("ws{n}"));
                if let Some(p) = &parent {
                    new = new.under(p);
                }
                let ws = store.create(new).unwrap();
                prop_assert_eq!(ws.depth as usize, parent.as_ref().map_or(0, |p| model.ancestors(p).len() + 1));
                model.add(ws.id, parent);
            }
            Step::Move { node, parent } => {
                let Some(node) = pick(node, &live) else { continue };
                let parent = parent.as_ref().and_then(|i| pick(i, &live));
                let before = model.ancestors(&node).len() as i32;

                match &parent {
                    Some(p) if model.would_cycle(&node, p) => {
                        let err = store.move_to(&node, Some(p)).unwrap_err();
                        prop_assert!(matches!(err, Error::InvalidOperation(_)));
                    }
                    _ => {
                        let subtree: Vec<(String, i32)> = store
                            .descendants(&node)
                            .unwrap()
                            .into_iter()
                            .map(|r| (r.node.id, r.node.depth))
                            .collect();
                        let moved = store.move_to(&node, parent.as_deref()).unwrap();
                        model.parent.insert(node.clone(), parent);
                        let shift = moved.depth - before;
                        prop_assert_eq!(moved.depth as usize, model.ancestors(&node).len());

                        // Every descendant shifts by the same amount
                        for (id, depth) in subtree {
                            prop_assert_eq!(store.get(&id).unwrap().depth, depth + shift);
                        }
                    }
                }
            }
            Step::Delete { node } => {
                let Some(node) = pick(node, &live) else { continue };
                let expected = model.subtree(&node);
                let removed: BTreeSet<String> = store.delete(&node).unwrap().into_iter().collect();
                prop_assert_eq!(&removed, &expected);
                model.deleted.extend(expected);
                prop_assert!(store.get(&node).unwrap_err().is_not_found());
            }
            Step::Repair => {
                let pending = repairer.check(TreeKind::Workspace).unwrap();
                let fixed = repairer.repair(TreeKind::Workspace).unwrap();
                prop_assert_eq!(fixed.orphaned_rows, pending.orphaned_rows);
                prop_assert_eq!(fixed.missing_self_rows, 0);
                prop_assert_eq!(fixed.transitive_gaps, 0);
                prop_assert!(repairer.check(TreeKind::Workspace).unwrap().is_clean());
                // Only live nodes keep rows
                prop_assert_eq!(stored_closure(&db, store.closure()), model.closure());
            }
        }
        prop_assert_eq!(live_closure(&db, store.closure(), &model), model.closure());
    }

    repairer.repair(TreeKind::Workspace).unwrap();
    prop_assert_eq!(stored_closure(&db, store.closure()), model.closure());
    Ok(())
}

fn run_todos(steps: &[TodoStep]) -> Result<(), TestCaseError> {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::open_at(dir.path().join("props.db")).unwrap();
    let workspaces = WorkspaceStore::new(db.clone());
    let first = workspaces.create(NewWorkspace::named("Inbox")).unwrap().id;
    let second = workspaces.create(NewWorkspace::named("Work")).unwrap().id;
    let todos = TodoStore::new(db.clone());
    let mut model = Model::default();
    let mut home: HashMap<String, String> = HashMap::new();

    for (n, step) in steps.iter().enumerate() {
        let live = model.live();
        match step {
            TodoStep::Create { parent, second: in_second } => {
                let parent = parent.as_ref().and_then(|i| pick(i, &live));
                // A child always lives in its parent's workspace
                let ws = match &parent {
                    Some(p) => home[p].clone(),
                    None if *in_second => second.clone(),
                    None => first.clone(),
                };
                let mut new = NewTodo::new(&ws, format!("t{n}"));
                if let Some(p) = &parent {
                    new = new.under(p);
                }
                let todo = todos.create(new).unwrap();
                prop_assert_eq!(&todo.workspace_id, &ws);
                home.insert(todo.id.clone(), ws);
                model.add(todo.id, parent);
            }
            TodoStep::Move { node, parent, workspace } => {
                let Some(node) = pick(node, &live) else { continue };
                let parent = parent.as_ref().and_then(|i| pick(i, &live));
                let target = workspace.map(|s| if s { second.clone() } else { first.clone() });
                let result = todos.move_to_workspace(&node, parent.as_deref(), target.as_deref());

                let cycles = parent.as_ref().is_some_and(|p| model.would_cycle(&node, p));
                let mismatch = match (&parent, &target) {
                    (Some(p), Some(ws)) => &home[p] != ws,
                    _ => false,
                };
                if cycles || mismatch {
                    prop_assert!(matches!(result, Err(Error::InvalidOperation(_))));
                    continue;
                }

                let moved = result.unwrap();
                let adopted = target.or_else(|| parent.as_ref().map(|p| home[p].clone()));
                model.parent.insert(node.clone(), parent);
                if let Some(ws) = adopted {
                    for id in model.subtree(&node) {
                        home.insert(id, ws.clone());
                    }
                }
                prop_assert_eq!(&moved.workspace_id, &home[&node]);
            }
        }
    }

    prop_assert_eq!(stored_closure(&db, todos.closure()), model.closure());
    for id in model.live() {
        let todo = todos.get(&id).unwrap();
        prop_assert_eq!(&todo.workspace_id, &home[&id]);
        // The whole tree shares its root's workspace
        let root = model.ancestors(&id).last().cloned().unwrap_or_else(|| id.clone());
        prop_assert_eq!(&todo.workspace_id, &todos.get(&root).unwrap().workspace_id);
        prop_assert_eq!(todo.depth as usize, model.ancestors(&id).len());
    }
    Ok(())
}

proptest! {
    #![proptest_config(config())]

    #[test]
    fn closure_matches_parent_map(steps in prop::collection::vec(step_strategy(), 1..24)) {
        run(&steps)?;
    }

    #[test]
    fn todo_moves_keep_subtree_in_one_workspace(steps in prop::collection::vec(todo_step_strategy(), 1..24)) {
        run_todos(&steps)?;
    }
}
