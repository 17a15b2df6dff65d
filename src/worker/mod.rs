//! Task execution on the consumer side of the broker.
//!
//! Per task: wait until no other task holds the input, wait until the input stops changing,
//! mark `processing_started`, run the module, mark `processing_done` whatever happened.

pub mod executor;
pub mod manifest;
pub mod pool;

pub use executor::{
    CommandOutcome, CommandRunner, ModuleHandler, ModuleRegistry, ProcessCommandRunner, TaskContext,
};
pub use manifest::ManifestHandler;
pub use pool::{PoolManager, PoolOptions, PoolSpec, default_pool_table, normalize_pool_table};

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::broker::TaskPayload;
use crate::catalog::ExecutorKind;
use crate::engine::tools::mtime_ns;
use crate::snapshot::{FileSignature, dir_size, file_signature};
use crate::store::{ClaimChecker, CoordinationStore};
use crate::utils::config::WorkerConsts;
use crate::{TaskInput, TaskStatus};

/// Poll intervals of a worker.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub claim_poll: Duration,
    pub settle_interval: Duration,
    pub settle_retry_interval: Duration,
    /// Recorded as the agent of every task this worker runs.
    pub agent: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            claim_poll: WorkerConsts::CLAIM_POLL,
            settle_interval: WorkerConsts::SETTLE_INTERVAL,
            settle_retry_interval: WorkerConsts::SETTLE_RETRY_INTERVAL,
            agent: String::new(),
        }
    }
}

/// Outcome of one task that got as far as running its module.
#[derive(Clone, Debug)]
pub struct TaskReport {
    pub module: String,
    pub input: PathBuf,
    pub succeeded: bool,
}

/// What became of one fetched payload.
#[derive(Clone, Debug)]
pub enum Execution {
    /// The module ran (or failed) and the row is `processing_done`.
    Finished(TaskReport),
    /// Stopped in the claim or settle wait, before `processing_started`. The row is still
    /// `task_created`; the payload belongs back on its queue.
    Interrupted,
}

/// Runs decoded payloads. Shared by every consumer of a pool.
pub struct TaskRunner {
    store: Arc<CoordinationStore>,
    claims: Arc<dyn ClaimChecker>,
    registry: Arc<ModuleRegistry>,
    commands: Arc<dyn CommandRunner>,
    settings: WorkerSettings,
}

/// Size and mtime of a file, or recursive size and own mtime of a directory.
fn input_signature(input: &TaskInput) -> Option<FileSignature> {
    match input {
        TaskInput::File(p) => file_signature(p),
        TaskInput::Dir(p) => {
            let meta = std::fs::metadata(p).ok()?;
            Some(FileSignature {
                size: dir_size(p),
                mtime_ns: mtime_ns(&meta),
            })
        }
    }
}

/// Sleep `total` in short slices. Returns false if `cancel` was raised meanwhile.
fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let slice = Duration::from_millis(100);
    let mut left = total;
    while !left.is_zero() {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let step = left.min(slice);
        std::thread::sleep(step);
        left -= step;
    }
    !cancel.load(Ordering::Relaxed)
}

impl TaskRunner {
    pub fn new(
        store: Arc<CoordinationStore>,
        registry: Arc<ModuleRegistry>,
        commands: Arc<dyn CommandRunner>,
        settings: WorkerSettings,
    ) -> Self {
        let claims: Arc<dyn ClaimChecker> = store.clone();
        Self {
            store,
            claims,
            registry,
            commands,
            settings,
        }
    }

    /// Replace the claim source (defaults to the store).
    pub fn with_claim_checker(mut self, claims: Arc<dyn ClaimChecker>) -> Self {
        self.claims = claims;
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Run one encoded payload. A payload that does not decode is an error. `cancel` is only
    /// honored while waiting; once started, the module runs to completion. Module failures
    /// are reported in the [`TaskReport`].
    pub fn execute(&self, payload: &str, cancel: &AtomicBool) -> Result<Execution> {
        let payload = TaskPayload::decode(payload)?;
        let ctx = TaskContext::from_payload(payload, &self.settings.agent);
        let module = ctx.module.name.clone();

        if !self.wait_unclaimed(&ctx.case_id, &ctx.input, cancel)
            || !self.wait_settled(&ctx.input, cancel)
        {
            debug!("{}: interrupted before start on {}", module, ctx.input.path().display());
            return Ok(Execution::Interrupted);
        }

        if let Err(e) =
            self.store
                .update_task(&module, &ctx.case_id, &ctx.input, TaskStatus::ProcessingStarted)
        {
            warn!("{}: mark started: {:#}", module, e);
        }
        info!("{} started on {}", module, ctx.input.path().display());

        let result = self.run_module(&ctx);
        let succeeded = match &result {
            Ok(()) => {
                info!("{} done on {}", module, ctx.input.path().display());
                true
            }
            Err(e) => {
                warn!("{} failed on {}: {:#}", module, ctx.input.path().display(), e);
                false
            }
        };

        if let Err(e) =
            self.store
                .update_task(&module, &ctx.case_id, &ctx.input, TaskStatus::ProcessingDone)
        {
            warn!("{}: mark done: {:#}", module, e);
        }

        Ok(Execution::Finished(TaskReport {
            module,
            input: ctx.input.path().to_path_buf(),
            succeeded,
        }))
    }

    fn run_module(&self, ctx: &TaskContext) -> Result<()> {
        match ctx.module.executor {
            ExecutorKind::Internal => {
                let handler = self
                    .registry
                    .get(&ctx.module.name)
                    .ok_or_else(|| anyhow!("no internal handler registered for {}", ctx.module.name))?;
                handler.run(ctx)
            }
            ExecutorKind::External => {
                let tool = ctx
                    .module
                    .tool
                    .as_ref()
                    .ok_or_else(|| anyhow!("{} has no [tool]", ctx.module.name))?;
                let outcome = self.commands.run(ctx, tool)?;
                if !outcome.stderr.trim().is_empty() {
                    debug!("{} stderr: {}", ctx.module.name, outcome.stderr.trim());
                }
                match (outcome.success(), outcome.timed_out) {
                    (true, _) => Ok(()),
                    (false, true) => Err(anyhow!("{} timed out", tool.path)),
                    (false, false) => Err(anyhow!("{} exited with {:?}", tool.path, outcome.exit_code)),
                }
            }
        }
    }

    /// Poll until no task holds `input`. A failing check counts as held.
    /// False when `cancel` was raised first.
    fn wait_unclaimed(&self, case_id: &str, input: &TaskInput, cancel: &AtomicBool) -> bool {
        loop {
            match self.claims.is_claimed(case_id, input) {
                Ok(false) => return true,
                Ok(true) => debug!("{} is claimed, waiting", input.path().display()),
                Err(e) => warn!("claim check for {} failed, waiting: {:#}", input.path().display(), e),
            }
            if !sleep_unless_cancelled(self.settings.claim_poll, cancel) {
                return false;
            }
        }
    }

    /// Poll size and mtime until two consecutive samples agree. A vanished input is settled.
    /// False when `cancel` was raised first.
    fn wait_settled(&self, input: &TaskInput, cancel: &AtomicBool) -> bool {
        let mut previous = input_signature(input);
        let mut interval = self.settings.settle_interval;
        loop {
            if !sleep_unless_cancelled(interval, cancel) {
                return false;
            }
            let current = input_signature(input);
            if current == previous || current.is_none() {
                return true;
            }
            debug!("{} still changing", input.path().display());
            previous = current;
            interval = self.settings.settle_retry_interval;
        }
    }
}
