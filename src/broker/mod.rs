//! Message broker: named queues of opaque task payloads.
//!
//! Two implementations: [`MemoryBroker`] (crossbeam channels, one process) and
//! [`SqliteBroker`] (a `task_queue` table, shared by every process that opens the file).

mod memory;
mod sqlite;

pub use memory::MemoryBroker;
pub use sqlite::SqliteBroker;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::TaskInput;
use crate::catalog::{ExecutionConstraints, ModuleRule};
use crate::naming::RenderedOutput;

/// Queue for a module: `{os_class}_{multithread|no_multithread}[_disk_only]`.
pub fn queue_name(c: &ExecutionConstraints) -> String {
    let threading = match c.multithreaded {
        true => "multithread",
        false => "no_multithread",
    };
    let mut name = format!("{}_{}", c.os_class, threading);
    if c.disk_only {
        name.push_str("_disk_only");
    }
    name
}

/// Queue transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Memory,
    #[default]
    Sqlite,
}

impl std::str::FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "memory" => Ok(BrokerKind::Memory),
            "sqlite" => Ok(BrokerKind::Sqlite),
            other => Err(format!("unknown broker {:?} (memory, sqlite)", other)),
        }
    }
}

/// Named FIFO queues. Payloads are opaque strings to the broker.
pub trait Broker: Send + Sync {
    /// Make `queue` accept submissions. Brokers that accept any queue need not override.
    fn declare(&self, _queue: &str) -> Result<()> {
        Ok(())
    }

    fn submit(&self, queue: &str, payload: &str) -> Result<()>;

    /// Next payload of `queue`, waiting at most `timeout`. `None` when the queue stayed empty.
    fn fetch(&self, queue: &str, timeout: Duration) -> Result<Option<String>>;

    /// Payloads waiting in `queue`.
    fn pending(&self, queue: &str) -> Result<usize>;
}

/// Everything a worker needs to run one task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// The file or directory the task was triggered by.
    pub input_hint: PathBuf,
    pub case_path: PathBuf,
    pub case_id: String,
    pub module: ModuleRule,
    pub input: TaskInput,
    pub output: RenderedOutput,
    pub queue: String,
}

impl TaskPayload {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("decode task payload")
    }
}
