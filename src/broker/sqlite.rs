//! Durable queues in the store file: any process that opens the same file can submit or consume.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::utils::config::{SQLITE_BROKER_POLL, STORE_BUSY_TIMEOUT};

use super::Broker;

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_task_queue_queue ON task_queue(queue, id);
"#;

/// Pops the oldest row of a queue atomically; two consumers never get the same payload.
const POP_SQL: &str = r#"
DELETE FROM task_queue
WHERE id = (SELECT id FROM task_queue WHERE queue = ?1 ORDER BY id LIMIT 1)
RETURNING payload
"#;

pub struct SqliteBroker {
    conn: Mutex<Connection>,
    poll: Duration,
}

impl SqliteBroker {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open broker {}", path.display()))?;
        conn.busy_timeout(STORE_BUSY_TIMEOUT)
            .context("set busy timeout")?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("enable WAL")?;
        conn.execute_batch(QUEUE_SCHEMA)
            .context("create task_queue")?;
        Ok(Self {
            conn: Mutex::new(conn),
            poll: SQLITE_BROKER_POLL,
        })
    }

    fn pop(&self, queue: &str) -> Result<Option<String>> {
        self.conn
            .lock()
            .unwrap()
            .query_row(POP_SQL, [queue], |row| row.get(0))
            .optional()
            .context("pop task")
    }
}

impl Broker for SqliteBroker {
    fn submit(&self, queue: &str, payload: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO task_queue (queue, payload) VALUES (?1, ?2)",
                [queue, payload],
            )
            .with_context(|| format!("enqueue on {}", queue))?;
        Ok(())
    }

    fn fetch(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.pop(queue)? {
                return Ok(Some(payload));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.poll.min(deadline - now));
        }
    }

    fn pending(&self, queue: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM task_queue WHERE queue = ?1",
                [queue],
                |row| row.get(0),
            )
            .context("count pending")?;
        Ok(n as usize)
    }
}
