//! Coordination store: per-module task tables, case status and persisted case snapshots.
//!
//! One SQLite file shared by the watch loop and every worker (in-process or not). WAL mode
//! plus a busy timeout let several processes read and write it at once.

mod master;
mod snapshot;
mod tasks;

use anyhow::{Context, Result};
use log::debug;
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::TaskInput;
use crate::utils::config::STORE_BUSY_TIMEOUT;

/// WAL tuning pragmas (synchronous, autocheckpoint, size limit). Use after PRAGMA journal_mode = WAL.
pub(crate) const WAL_PRAGMAS: &str = r#"
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 10000;
        PRAGMA journal_size_limit = 67108864;
        "#;

/// Fixed tables. Module tables are created on demand and listed in `module_registry`.
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS master_status (
    case_path TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    case_id TEXT NOT NULL,
    modules_selected TEXT NOT NULL,
    timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS case_snapshot (
    case_id TEXT NOT NULL,
    case_path TEXT NOT NULL,
    path TEXT NOT NULL,
    entry_type TEXT NOT NULL,
    PRIMARY KEY (case_id, path)
);
CREATE INDEX IF NOT EXISTS idx_case_snapshot_case_path ON case_snapshot(case_path);

CREATE TABLE IF NOT EXISTS module_registry (
    name TEXT PRIMARY KEY
);
"#;

/// Names module tables may not take.
pub const RESERVED_TABLES: &[&str] = &["master_status", "case_snapshot", "module_registry", "task_queue"];

/// True if `name` is a fixed table (or an SQLite internal one).
pub fn is_reserved_table(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("sqlite_") || RESERVED_TABLES.contains(&lower.as_str())
}

/// Letters, digits and `_`, not starting with a digit. Module names become table names.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn module_table_sql(module: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS "{m}" (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    case_id TEXT NOT NULL,
    case_path TEXT NOT NULL,
    agent TEXT NOT NULL DEFAULT '',
    input_file TEXT NOT NULL DEFAULT '',
    input_dir TEXT NOT NULL DEFAULT '',
    output_file TEXT NOT NULL DEFAULT '',
    output_dir TEXT NOT NULL DEFAULT '',
    output_prefix TEXT NOT NULL DEFAULT '',
    processing_status TEXT NOT NULL,
    timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS "idx_{m}_case_status" ON "{m}"(case_id, processing_status);
INSERT OR IGNORE INTO module_registry (name) VALUES ('{m}');
"#,
        m = module
    )
}

/// Enable WAL and apply schema to an open connection (idempotent).
fn apply_wal_and_schema(conn: &Connection) -> Result<()> {
    conn.busy_timeout(STORE_BUSY_TIMEOUT)
        .context("set busy timeout")?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        .context("enable WAL")?;
    conn.execute_batch(WAL_PRAGMAS).context("set WAL pragmas")?;
    conn.execute_batch(SCHEMA).context("create schema")?;
    Ok(())
}

/// Answers "is this input currently being worked on?" for the worker's claim wait.
pub trait ClaimChecker: Send + Sync {
    fn is_claimed(&self, case_id: &str, input: &TaskInput) -> Result<bool>;
}

/// Shared relational store. All methods take `&self`; the connection is behind a mutex.
pub struct CoordinationStore {
    conn: Mutex<Connection>,
    known_tables: Mutex<HashSet<String>>,
}

impl CoordinationStore {
    /// Open or create the store file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open store {}", path.display()))?;
        apply_wal_and_schema(&conn)?;
        debug!("store opened at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory store (single process).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        conn.execute_batch(SCHEMA).context("create schema")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            known_tables: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Create the task table of `module` if missing and register it.
    pub fn ensure_module_table(&self, module: &str) -> Result<()> {
        if self.known_tables.lock().unwrap().contains(module) {
            return Ok(());
        }
        if !is_valid_identifier(module) || is_reserved_table(module) {
            anyhow::bail!("invalid module table name: {:?}", module);
        }
        self.conn()
            .execute_batch(&module_table_sql(module))
            .with_context(|| format!("create table for module {}", module))?;
        self.known_tables
            .lock()
            .unwrap()
            .insert(module.to_string());
        Ok(())
    }

    /// Every registered module table, including ones created by other processes.
    pub fn module_tables(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT name FROM module_registry ORDER BY name")
            .context("prepare module list")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let name = row?;
            if is_valid_identifier(&name) && !is_reserved_table(&name) {
                out.push(name);
            }
        }
        Ok(out)
    }
}

impl ClaimChecker for CoordinationStore {
    fn is_claimed(&self, case_id: &str, input: &TaskInput) -> Result<bool> {
        self.is_input_claimed(case_id, input)
    }
}
