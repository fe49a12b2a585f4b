//! lazytodo - Hierarchical todo storage engine
//!
//! Workspaces and todos are two independent trees of arbitrary depth, each
//! backed by a closure table. Every mutation is journaled in a write-ahead
//! log that is replayed after a crash and read back for undo/redo.
//!
//! # Components
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `closure` | Ancestor/descendant/depth queries over one tree |
//! | `store` | Atomic create, move, reorder, soft-delete per tree |
//! | `wal` | Durable, debounced operation journal |
//! | `repair` | Idempotent closure table reconciliation |
//! | `engine` | Stores + log + history behind one facade |
//!
//! # Quick Start
//!
//! ```no_run
//! use lazytodo::{Config, Engine, NewTodo, NewWorkspace};
//!
//! let engine = Engine::open(Config::load()).unwrap();
//!
//! // Nest a workspace and add a todo to it
//! let work = engine.create_workspace(NewWorkspace::named("Work")).unwrap();
//! let infra = engine.create_workspace(NewWorkspace::named("Infra").under(&work.id)).unwrap();
//! let todo = engine.create_todo(NewTodo::new(&infra.id, "Rotate certificates")).unwrap();
//!
//! engine.toggle_todo(&todo.id).unwrap();
//! engine.undo().unwrap();
//! engine.close().unwrap();
//! ```

pub mod closure;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod repair;
pub mod replay;
pub mod schema;
pub mod store;
pub mod wal;

pub use closure::{ClosureRow, ClosureTable};
pub use config::Config;
pub use db::{Database, CURRENT_SCHEMA_VERSION};
pub use engine::{Engine, StartupReport};
pub use error::{Error, Result};
pub use model::{NewTodo, NewWorkspace, Todo, TodoStatus, TreeKind, Workspace};
pub use repair::{IntegrityReport, Repairer};
pub use replay::Replayer;
pub use store::{Relative, TodoStore, TreeNode, TreeStore, WorkspaceStore};
pub use wal::{NewOperation, Operation, OperationType, RecoveryReport, Wal, WalConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify core types are re-exported from crate root
        assert_eq!(CURRENT_SCHEMA_VERSION, 1);
        assert_eq!(TreeKind::all().len(), 2);
    }
}
