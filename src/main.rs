use chrono::{NaiveDate, TimeZone, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;
use lazytodo::model::{self, NewTodo, NewWorkspace, Todo, Workspace, URGENCY_CRITICAL, URGENCY_LOW};
use lazytodo::{Config, Database, Engine, Error, Operation, Result, TreeKind, TreeStore};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lazytodo")]
#[command(author, version, about = "Hierarchical todos with undo, backed by SQLite")]
struct Cli {
    /// Database file (overrides LAZYTODO_DB_PATH and the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage workspaces
    #[command(subcommand)]
    Ws(WsCommand),

    /// Manage todos
    #[command(subcommand)]
    Todo(TodoCommand),

    /// Revert the last change
    Undo,

    /// Re-apply the last undone change
    Redo,

    /// Show recent operations
    Log {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Check and repair the closure tables
    Repair {
        /// Only report, change nothing
        #[arg(long)]
        check: bool,
    },

    /// Remove old undone operations from the log
    Gc {
        /// Age in days (default: wal.retention_days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
enum WsCommand {
    /// Create a workspace
    Add {
        name: String,
        /// Parent workspace (id or name)
        #[arg(short, long)]
        parent: Option<String>,
        #[arg(long, default_value = "0")]
        position: i32,
    },
    /// List workspaces as a tree
    Ls {
        /// Include system workspaces
        #[arg(short, long)]
        all: bool,
    },
    /// Move a workspace under another one (or to the root)
    Mv {
        workspace: String,
        #[arg(short, long)]
        parent: Option<String>,
    },
    /// Delete a workspace and its children
    Rm { workspace: String },
    Rename { workspace: String, name: String },
    /// Make a workspace a child of the one above it
    Indent { workspace: String },
    /// Move a workspace up one level
    Outdent { workspace: String },
    Up { workspace: String },
    Down { workspace: String },
}

#[derive(Subcommand, Debug)]
enum TodoCommand {
    /// Add a todo to a workspace
    Add {
        /// Workspace (id or name)
        workspace: String,
        description: String,
        #[arg(short, long)]
        parent: Option<String>,
        /// 1 (low) to 4 (critical)
        #[arg(short, long, default_value = "2", value_parser = clap::value_parser!(i32).range(i64::from(URGENCY_LOW)..=i64::from(URGENCY_CRITICAL)))]
        urgency: i32,
        /// Due date, YYYY-MM-DD
        #[arg(long)]
        due: Option<String>,
        #[arg(long, default_value = "0")]
        position: i32,
    },
    /// List the todos of a workspace
    Ls {
        workspace: String,
        #[arg(long)]
        archived: bool,
    },
    /// Toggle completion
    Done {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Move a todo (and its subtree)
    Mv {
        id: String,
        #[arg(short, long)]
        parent: Option<String>,
        /// Target workspace (id or name)
        #[arg(short, long)]
        workspace: Option<String>,
    },
    /// Delete todos and their subtrees
    Rm {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Search descriptions
    Search {
        query: String,
        #[arg(long)]
        archived: bool,
    },
    /// Archive todos
    Archive {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Indent { id: String },
    Outdent { id: String },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LAZYTODO_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Command::Completion { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "lazytodo", &mut io::stdout());
        return;
    }

    let config = Config::load();
    let engine = match cli.db {
        Some(path) => Database::open_at(path).and_then(|db| Engine::with_database(db, config)),
        None => Engine::open(config),
    };
    let engine = match engine {
        Ok(engine) => engine,
        Err(e) => exit_with(&e),
    };

    let result = run(&engine, cli.command);
    let closed = engine.close();
    if let Err(e) = result.and(closed) {
        exit_with(&e);
    }
}

fn exit_with(e: &Error) -> ! {
    if e.is_fatal() {
        eprintln!("{} {}", "fatal:".red().bold(), e);
    } else {
        eprintln!("{} {}", "Error:".red().bold(), e);
    }
    std::process::exit(1);
}

fn run(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Ws(cmd) => run_ws(engine, cmd),
        Command::Todo(cmd) => run_todo(engine, cmd),
        Command::Undo => {
            let ops = engine.undo()?;
            if ops.is_empty() {
                println!("Nothing to undo");
            }
            for op in &ops {
                println!("{} {}", "Undone".yellow(), describe(op));
            }
            Ok(())
        }
        Command::Redo => {
            let ops = engine.redo()?;
            if ops.is_empty() {
                println!("Nothing to redo");
            }
            for op in &ops {
                println!("{} {}", "Redone".green(), describe(op));
            }
            Ok(())
        }
        Command::Log { limit } => {
            for op in engine.history(limit)? {
                let state = if op.is_undone {
                    "undone".yellow()
                } else if op.applied {
                    "applied".green()
                } else {
                    "pending".cyan()
                };
                println!("{:>6}  {}  {:<8} {}", op.id, op.created_at.dimmed(), state, describe(&op));
            }
            Ok(())
        }
        Command::Repair { check } => {
            let reports = if check { engine.check()? } else { engine.repair()? };
            for (kind, report) in reports {
                let line = format!("{:<9} {}", kind.to_string(), report);
                if report.is_clean() {
                    println!("{}", line);
                } else {
                    println!("{}", line.yellow());
                }
            }
            Ok(())
        }
        Command::Gc { days } => {
            let removed = engine.gc(days.map(|d| chrono::Duration::days(i64::from(d))))?;
            println!("Removed {} operations", removed);
            Ok(())
        }
        Command::Completion { .. } => Ok(()),
    }
}

fn run_ws(engine: &Engine, cmd: WsCommand) -> Result<()> {
    match cmd {
        WsCommand::Add { name, parent, position } => {
            let mut new = NewWorkspace::named(name).at(position);
            if let Some(parent) = parent {
                new = new.under(resolve_workspace(engine, &parent)?.id);
            }
            let ws = engine.create_workspace(new)?;
            println!("{} workspace {} {}", "Created".green(), ws.name.bold(), ws.id.dimmed());
        }
        WsCommand::Ls { all } => {
            let list = engine.workspaces().list_all()?;
            for ws in tree_order(list, |w| w.parent_id.clone(), |w| w.id.clone()) {
                if ws.is_system() && !all {
                    continue;
                }
                let indent = "  ".repeat(ws.depth as usize);
                let name = if ws.is_system() { ws.name.dimmed() } else { ws.name.bold() };
                println!("{}{} {}", indent, name, ws.id.dimmed());
            }
        }
        WsCommand::Mv { workspace, parent } => {
            let id = resolve_workspace(engine, &workspace)?.id;
            let parent = parent.map(|p| resolve_workspace(engine, &p)).transpose()?;
            let ws = engine.move_workspace(&id, parent.as_ref().map(|p| p.id.as_str()))?;
            println!("{} {} (depth {})", "Moved".green(), ws.name.bold(), ws.depth);
        }
        WsCommand::Rm { workspace } => {
            let id = resolve_workspace(engine, &workspace)?.id;
            let removed = engine.delete_workspace(&id)?;
            println!("{} {} workspace(s)", "Deleted".red(), removed.len());
        }
        WsCommand::Rename { workspace, name } => {
            let id = resolve_workspace(engine, &workspace)?.id;
            let ws = engine.rename_workspace(&id, &name)?;
            println!("{} {}", "Renamed".green(), ws.name.bold());
        }
        WsCommand::Indent { workspace } => {
            let ws = engine.indent_workspace(&resolve_workspace(engine, &workspace)?.id)?;
            println!("{} {} (depth {})", "Indented".green(), ws.name.bold(), ws.depth);
        }
        WsCommand::Outdent { workspace } => {
            let ws = engine.outdent_workspace(&resolve_workspace(engine, &workspace)?.id)?;
            println!("{} {} (depth {})", "Outdented".green(), ws.name.bold(), ws.depth);
        }
        WsCommand::Up { workspace } => {
            let ws = engine.workspace_up(&resolve_workspace(engine, &workspace)?.id)?;
            println!("{} {} to position {}", "Moved".green(), ws.name.bold(), ws.position);
        }
        WsCommand::Down { workspace } => {
            let ws = engine.workspace_down(&resolve_workspace(engine, &workspace)?.id)?;
            println!("{} {} to position {}", "Moved".green(), ws.name.bold(), ws.position);
        }
    }
    Ok(())
}

fn run_todo(engine: &Engine, cmd: TodoCommand) -> Result<()> {
    match cmd {
        TodoCommand::Add {
            workspace,
            description,
            parent,
            urgency,
            due,
            position,
        } => {
            let ws = resolve_workspace(engine, &workspace)?;
            let mut new = NewTodo::new(ws.id, description).at(position);
            new.urgency = urgency;
            new.due_date = due.as_deref().map(parse_due).transpose()?;
            if let Some(parent) = parent {
                new = new.under(parent);
            }
            let todo = engine.create_todo(new)?;
            println!("{} todo {}", "Created".green(), todo.id);
        }
        TodoCommand::Ls { workspace, archived } => {
            let ws = resolve_workspace(engine, &workspace)?;
            let todos = engine.todos().list_by_workspace(&ws.id, archived)?;
            if todos.is_empty() {
                println!("{}", "No todos".dimmed());
            }
            let now = Utc::now();
            for todo in tree_order(todos, |t| t.parent_id.clone(), |t| t.id.clone()) {
                println!("{}", format_todo(&todo, now));
            }
        }
        TodoCommand::Done { ids } => {
            let todos = engine.batch(|e| ids.iter().map(|id| e.toggle_todo(id)).collect::<Result<Vec<_>>>())?;
            for todo in todos {
                let state = if todo.is_completed() { "Completed".green() } else { "Reopened".yellow() };
                println!("{} {}", state, todo.description);
            }
        }
        TodoCommand::Mv { id, parent, workspace } => {
            let ws = workspace.map(|w| resolve_workspace(engine, &w)).transpose()?;
            let todo = engine.move_todo(&id, parent.as_deref(), ws.as_ref().map(|w| w.id.as_str()))?;
            println!("{} {} (depth {})", "Moved".green(), todo.description, todo.depth);
        }
        TodoCommand::Rm { ids } => {
            let removed = engine.batch(|e| {
                ids.iter()
                    .map(|id| e.delete_todo(id).map(|r| r.len()))
                    .sum::<Result<usize>>()
            })?;
            println!("{} {} todo(s)", "Deleted".red(), removed);
        }
        TodoCommand::Search { query, archived } => {
            let now = Utc::now();
            for todo in engine.todos().search(&query, archived)? {
                println!("{}", format_todo(&todo, now));
            }
        }
        TodoCommand::Archive { ids } => {
            let todos = engine.batch(|e| ids.iter().map(|id| e.archive_todo(id)).collect::<Result<Vec<_>>>())?;
            println!("{} {} todo(s)", "Archived".green(), todos.len());
        }
        TodoCommand::Indent { id } => {
            let todo = engine.indent_todo(&id)?;
            println!("{} {} (depth {})", "Indented".green(), todo.description, todo.depth);
        }
        TodoCommand::Outdent { id } => {
            let todo = engine.outdent_todo(&id)?;
            println!("{} {} (depth {})", "Outdented".green(), todo.description, todo.depth);
        }
    }
    Ok(())
}

/// Workspace by exact id, else by case-insensitive name
fn resolve_workspace(engine: &Engine, key: &str) -> Result<Workspace> {
    match engine.workspaces().get(key) {
        Err(e) if e.is_not_found() => {}
        other => return other,
    }
    let mut matches: Vec<Workspace> = engine
        .workspaces()
        .list_all()?
        .into_iter()
        .filter(|w| w.name.eq_ignore_ascii_case(key))
        .collect();
    match matches.len() {
        0 => Err(Error::not_found(TreeKind::Workspace, key)),
        1 => Ok(matches.remove(0)),
        n => Err(Error::invalid(format!("{} workspaces are named '{}', use an id", n, key))),
    }
}

fn parse_due(s: &str) -> Result<String> {
    if let Some(ts) = model::parse_ts(s) {
        return Ok(model::format_ts(ts));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| Error::invalid(format!("invalid due date '{}', expected YYYY-MM-DD", s)))?;
    let end_of_day = date
        .and_hms_opt(23, 59, 59)
        .ok_or_else(|| Error::invalid(format!("invalid due date '{}'", s)))?;
    Ok(model::format_ts(Utc.from_utc_datetime(&end_of_day)))
}

/// Depth-first order: each node followed by its children, keeping the
/// relative order of the input
fn tree_order<T>(nodes: Vec<T>, parent: impl Fn(&T) -> Option<String>, id: impl Fn(&T) -> String) -> Vec<T> {
    let ids: std::collections::HashSet<String> = nodes.iter().map(&id).collect();
    let mut children: HashMap<Option<String>, Vec<T>> = HashMap::new();
    for node in nodes {
        // Nodes whose parent is not in the list are shown at the top level
        let key = parent(&node).filter(|p| ids.contains(p));
        children.entry(key).or_default().push(node);
    }
    let mut out = Vec::new();
    let mut stack: Vec<T> = children.remove(&None).unwrap_or_default().into_iter().rev().collect();
    while let Some(node) = stack.pop() {
        if let Some(kids) = children.remove(&Some(id(&node))) {
            stack.extend(kids.into_iter().rev());
        }
        out.push(node);
    }
    out
}

fn format_todo(todo: &Todo, now: chrono::DateTime<Utc>) -> String {
    let mut line = "  ".repeat(todo.depth as usize);
    if todo.is_completed() {
        line.push_str(&format!("{} ", "[x]".green()));
    } else {
        line.push_str("[ ] ");
    }
    if todo.urgency > URGENCY_LOW {
        line.push_str(&format!("{} ", "!".repeat((todo.urgency - 1) as usize).red()));
    }
    let description = if todo.is_overdue(now) {
        todo.description.red()
    } else if todo.is_completed() {
        todo.description.dimmed()
    } else {
        todo.description.normal()
    };
    line.push_str(&description.to_string());
    if let Some(due) = todo.due_date.as_deref() {
        let day = due.get(..10).unwrap_or(due);
        if todo.is_due_today(now) {
            line.push_str(&format!(" {}", format!("(due today {})", day).yellow()));
        } else {
            line.push_str(&format!(" (due {})", day));
        }
    }
    if todo.is_archived {
        line.push_str(&format!(" {}", "[archived]".dimmed()));
    }
    line.push_str(&format!(" {}", todo.id.dimmed()));
    line
}

fn describe(op: &Operation) -> String {
    format!("{} {} {}", op.operation_type, op.entity_type, op.entity_id)
}
