//! casewatch: watch forensic case directories, match new entries against module rules,
//! wait for directories to go idle, dispatch tasks to per-constraint queues and
//! coordinate the worker fleet through a shared SQLite store.

pub mod broker;
pub mod catalog;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod idle;
pub mod matcher;
pub mod monitor;
pub mod naming;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod utils;
pub mod worker;

/// Re-export types for API
pub use types::*;

pub use broker::{Broker, BrokerKind, MemoryBroker, SqliteBroker, TaskPayload, queue_name};
pub use catalog::{Catalog, ModuleRule, ModuleSelection, PathPattern};
pub use dispatch::{TaskDispatcher, TaskId};
pub use error::{ConfigError, DispatchError};
pub use idle::{IdleDetector, IdleDirectory, SizeMeter};
pub use matcher::{EventOrigin, FsEvent, RuleMatcher, Trigger};
pub use monitor::{CaseMonitor, DispatchFailurePolicy, MonitorExit, MonitorReport, MonitorSettings};
pub use snapshot::{WalkOpts, scan};
pub use store::{ClaimChecker, CoordinationStore};
pub use worker::{PoolManager, PoolSpec, TaskRunner, WorkerSettings};

/// Result alias used by the public casewatch API
pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;
