//! Application configuration constants.
//! Tuning and thresholds in one place.

use std::sync::OnceLock;
use std::time::Duration;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

/// Package-derived names: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    pkg_name: &'static str,
    config_filename: String,
    store_filename: String,
    agent_env_var: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    /// Build and cache names from `CARGO_PKG_NAME`. Called once on first use.
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                pkg_name: pkg,
                config_filename: format!("{pkg}.toml"),
                store_filename: format!("{pkg}.db"),
                agent_env_var: format!("{}_AGENT", pkg.to_uppercase()),
            }
        })
    }

    pub fn pkg_name(&self) -> &str {
        self.pkg_name
    }

    /// `casewatch.toml`
    pub fn config_filename(&self) -> &str {
        &self.config_filename
    }

    /// Default coordination store file.
    pub fn store_filename(&self) -> &str {
        &self.store_filename
    }

    /// Environment variable overriding the agent id.
    pub fn agent_env_var(&self) -> &str {
        &self.agent_env_var
    }
}

// ---- Watch loop ----

pub struct WatchConsts;

impl WatchConsts {
    /// Sleep between scan cycles.
    pub const SCAN_INTERVAL: Duration = Duration::from_secs(10);
    /// Idle cooldown for directory triggers.
    pub const COOLDOWN: Duration = Duration::from_secs(20);
    /// Sleep slice while waiting, so cancellation is seen promptly.
    pub const CANCEL_POLL: Duration = Duration::from_millis(200);
    /// Default catalog location, relative to the working directory.
    pub const CATALOG_DIR: &'static str = "configs/modules";
}

// ---- Worker ----

pub struct WorkerConsts;

impl WorkerConsts {
    /// Poll interval of the claim wait.
    pub const CLAIM_POLL: Duration = Duration::from_secs(3);
    /// First write-settle sample interval.
    pub const SETTLE_INTERVAL: Duration = Duration::from_millis(500);
    /// Sample interval once the input was seen changing.
    pub const SETTLE_RETRY_INTERVAL: Duration = Duration::from_millis(100);
    /// Hard limit for one external tool run.
    pub const TASK_TIME_LIMIT: Duration = Duration::from_secs(36_000);
    /// How long a consumer blocks on an empty queue before re-checking shutdown.
    pub const FETCH_TIMEOUT: Duration = Duration::from_millis(500);
    /// Consumers above a group's minimum retire after this long without work.
    pub const IDLE_RETIRE: Duration = Duration::from_secs(30);
    /// Pool supervisor cadence.
    pub const SUPERVISOR_TICK: Duration = Duration::from_millis(500);
}

// ---- Pool sizing ----

pub struct PoolConsts;

impl PoolConsts {
    /// Concurrency ceiling of `windows_multithread` (remote hosts, not this one).
    pub const WINDOWS_CORES: usize = 2;
    /// Minimum consumers of `unix_multithread_disk_only`.
    pub const DISK_ONLY_MULTITHREAD_MIN: usize = 2;
}

// ---- Hashing ----

/// Hashing I/O thresholds and buffer sizes.
pub struct HashingConsts;

impl HashingConsts {
    /// File size above which hashing uses memory-mapped I/O (bytes). 100 MB.
    pub const HASH_MMAP_THRESHOLD: u64 = 100 * 1024 * 1024;
    /// Chunk size for reading files below mmap threshold (bytes). 1 MB.
    pub const HASH_READ_CHUNK_SIZE: usize = 1024 * 1024;
}

// ---- Output naming ----

/// Max bytes of `{input_file}` in output names.
pub const INPUT_FILE_NAME_MAX: usize = 255;
/// Hex chars of `{input_path_hash}`.
pub const INPUT_PATH_HASH_LEN: usize = 32;

// ---- Database ----

/// SQLite busy timeout; several processes share one store file.
pub const STORE_BUSY_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval of the SQLite-backed broker when a queue is empty.
pub const SQLITE_BROKER_POLL: Duration = Duration::from_millis(100);
