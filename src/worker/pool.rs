//! Consumer groups: one per queue, each scaled between its own min and max.

use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::broker::Broker;
use crate::utils::config::{PoolConsts, WorkerConsts};

use super::{Execution, TaskRunner};

/// One consumer group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub queue: String,
    pub min: usize,
    pub max: usize,
}

impl PoolSpec {
    pub fn new(queue: impl Into<String>, min: usize, max: usize) -> Self {
        Self {
            queue: queue.into(),
            min,
            max,
        }
    }
}

/// Descriptors the agent holds whatever its pool size: stdio, the log, the store and
/// broker connections (SQLite in WAL mode keeps db, -wal and -shm open each) and a
/// watch loop walking the case in the same process.
const FDS_BASELINE: u64 = 64;
/// Descriptors one busy consumer holds: the tool's stdout and stderr pipes, input and
/// output files of a built-in handler and the directory handles of its tree walk.
/// The tool's own descriptors live in the child and do not count.
const FDS_PER_CONSUMER: u64 = 8;

/// Soft `RLIMIT_NOFILE`, or `None` when unlimited or unknown.
#[cfg(unix)]
fn soft_fd_limit() -> Option<u64> {
    use std::mem::MaybeUninit;
    let mut rlim = MaybeUninit::<libc::rlimit>::uninit();
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) } != 0 {
        return None;
    }
    let cur = unsafe { rlim.assume_init() }.rlim_cur;
    if cur == libc::RLIM_INFINITY || cur > i64::MAX as u64 {
        return None;
    }
    Some(cur)
}

#[cfg(not(unix))]
fn soft_fd_limit() -> Option<u64> {
    None
}

/// Consumers each of `groups` core-sized groups may run under an fd limit of `limit`,
/// keeping a fifth of it spare. Never below one.
pub fn consumers_within_fd_limit(limit: u64, groups: usize) -> usize {
    let usable = (limit / 5 * 4).saturating_sub(FDS_BASELINE);
    let per_group = usable / FDS_PER_CONSUMER / groups.max(1) as u64;
    usize::try_from(per_group).unwrap_or(usize::MAX).max(1)
}

/// Consumers one of `groups` core-sized groups gets: rayon's thread count, capped so
/// all of them together stay within the fd limit.
fn cores_per_group(groups: usize) -> usize {
    let cores = rayon::current_num_threads();
    soft_fd_limit()
        .map(|limit| cores.min(consumers_within_fd_limit(limit, groups)))
        .unwrap_or(cores)
        .max(1)
}

/// Consumers this host can give a single core-sized group.
pub fn host_cores() -> usize {
    cores_per_group(1)
}

/// The fleet every agent runs unless configured otherwise. Disk-only groups exist only
/// when the agent sits next to the shared storage.
pub fn default_pool_table(standalone: bool, windows_cores: usize) -> Vec<PoolSpec> {
    // unix_multithread, plus unix_multithread_disk_only when standalone
    let cores = cores_per_group(if standalone { 2 } else { 1 });
    let mut table = vec![
        PoolSpec::new("unix_no_multithread", 1, 1),
        PoolSpec::new("unix_multithread", 1, cores),
        PoolSpec::new("windows_no_multithread", 1, 1),
        PoolSpec::new("windows_multithread", 1, windows_cores.max(1)),
    ];
    if standalone {
        table.push(PoolSpec::new("unix_no_multithread_disk_only", 1, 1));
        table.push(PoolSpec::new(
            "unix_multithread_disk_only",
            PoolConsts::DISK_ONLY_MULTITHREAD_MIN,
            cores.max(PoolConsts::DISK_ONLY_MULTITHREAD_MIN),
        ));
    }
    table
}

/// Cap `no_multithread` groups at one consumer, keep `min <= max`, drop duplicate queues
/// (the last entry wins).
pub fn normalize_pool_table(specs: &[PoolSpec]) -> Vec<PoolSpec> {
    let mut out: Vec<PoolSpec> = Vec::with_capacity(specs.len());
    for s in specs {
        let mut s = s.clone();
        if s.queue.contains("no_multithread") {
            s.max = 1;
        }
        s.max = s.max.max(1);
        s.min = s.min.min(s.max);
        out.retain(|o| o.queue != s.queue);
        out.push(s);
    }
    out
}

/// Timing knobs of the pool.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub fetch_timeout: Duration,
    pub idle_retire: Duration,
    pub tick: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: WorkerConsts::FETCH_TIMEOUT,
            idle_retire: WorkerConsts::IDLE_RETIRE,
            tick: WorkerConsts::SUPERVISOR_TICK,
        }
    }
}

struct Group {
    spec: PoolSpec,
    live: Arc<AtomicUsize>,
    busy: Arc<AtomicUsize>,
    consumers: Vec<JoinHandle<()>>,
}

struct ConsumerCtx {
    queue: String,
    min: usize,
    live: Arc<AtomicUsize>,
    busy: Arc<AtomicUsize>,
    broker: Arc<dyn Broker>,
    runner: Arc<TaskRunner>,
    shutdown: Arc<AtomicBool>,
    opts: PoolOptions,
}

/// Leave the group if it stays above its minimum without us.
fn try_retire(live: &AtomicUsize, min: usize) -> bool {
    live.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > min).then(|| n - 1))
        .is_ok()
}

/// Hand a fetched but unstarted task back, so another consumer or agent picks it up.
fn requeue(ctx: &ConsumerCtx, payload: &str) {
    match ctx.broker.submit(&ctx.queue, payload) {
        Ok(()) => info!("{}: shutting down, task put back on the queue", ctx.queue),
        Err(e) => warn!("{}: could not put task back, it stays task_created: {:#}", ctx.queue, e),
    }
}

fn consumer_loop(ctx: ConsumerCtx) {
    let mut idle_since = Instant::now();
    loop {
        if ctx.shutdown.load(Ordering::Relaxed) {
            ctx.live.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        match ctx.broker.fetch(&ctx.queue, ctx.opts.fetch_timeout) {
            Ok(Some(payload)) => {
                ctx.busy.fetch_add(1, Ordering::SeqCst);
                match ctx.runner.execute(&payload, &ctx.shutdown) {
                    Ok(Execution::Finished(report)) => debug!(
                        "{}: {} on {} finished (ok: {})",
                        ctx.queue,
                        report.module,
                        report.input.display(),
                        report.succeeded
                    ),
                    Ok(Execution::Interrupted) => requeue(&ctx, &payload),
                    Err(e) => warn!("{}: task dropped: {:#}", ctx.queue, e),
                }
                ctx.busy.fetch_sub(1, Ordering::SeqCst);
                idle_since = Instant::now();
            }
            Ok(None) => {
                if idle_since.elapsed() >= ctx.opts.idle_retire && try_retire(&ctx.live, ctx.min) {
                    debug!("{}: idle consumer retired", ctx.queue);
                    return;
                }
            }
            Err(e) => {
                warn!("{}: fetch failed: {:#}", ctx.queue, e);
                thread::sleep(ctx.opts.fetch_timeout);
            }
        }
    }
}

/// Runs the consumer groups of a pool table until shut down.
pub struct PoolManager {
    shutdown: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
    specs: Vec<PoolSpec>,
}

impl PoolManager {
    /// Declare every queue on the broker and start each group at its minimum.
    pub fn start(
        specs: &[PoolSpec],
        broker: Arc<dyn Broker>,
        runner: Arc<TaskRunner>,
        opts: PoolOptions,
    ) -> Result<Self> {
        let specs = normalize_pool_table(specs);
        for s in &specs {
            broker.declare(&s.queue)?;
            info!("pool {}: {}..{} consumers", s.queue, s.min, s.max);
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let groups: Vec<Group> = specs
            .iter()
            .map(|spec| Group {
                spec: spec.clone(),
                live: Arc::new(AtomicUsize::new(0)),
                busy: Arc::new(AtomicUsize::new(0)),
                consumers: Vec::new(),
            })
            .collect();

        let flag = Arc::clone(&shutdown);
        let supervisor = thread::spawn(move || supervise(groups, broker, runner, flag, opts));
        Ok(Self {
            shutdown,
            supervisor: Some(supervisor),
            specs,
        })
    }

    pub fn specs(&self) -> &[PoolSpec] {
        &self.specs
    }

    /// Flag that stops the pool when raised (e.g. from a Ctrl+C handler).
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Block until the pool stops.
    pub fn wait(&mut self) {
        if let Some(h) = self.supervisor.take() {
            let _ = h.join();
        }
    }

    /// Stop fetching, let running tasks finish, put back tasks that had not started yet,
    /// join every consumer.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wait();
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_consumer(
    group: &mut Group,
    broker: &Arc<dyn Broker>,
    runner: &Arc<TaskRunner>,
    shutdown: &Arc<AtomicBool>,
    opts: &PoolOptions,
) {
    group.live.fetch_add(1, Ordering::SeqCst);
    let ctx = ConsumerCtx {
        queue: group.spec.queue.clone(),
        min: group.spec.min,
        live: Arc::clone(&group.live),
        busy: Arc::clone(&group.busy),
        broker: Arc::clone(broker),
        runner: Arc::clone(runner),
        shutdown: Arc::clone(shutdown),
        opts: opts.clone(),
    };
    group.consumers.push(thread::spawn(move || consumer_loop(ctx)));
}

fn supervise(
    mut groups: Vec<Group>,
    broker: Arc<dyn Broker>,
    runner: Arc<TaskRunner>,
    shutdown: Arc<AtomicBool>,
    opts: PoolOptions,
) {
    for g in &mut groups {
        for _ in 0..g.spec.min {
            spawn_consumer(g, &broker, &runner, &shutdown, &opts);
        }
    }

    while !shutdown.load(Ordering::Relaxed) {
        for g in &mut groups {
            let (done, running): (Vec<_>, Vec<_>) =
                g.consumers.drain(..).partition(|h| h.is_finished());
            for h in done {
                let _ = h.join();
            }
            g.consumers = running;

            let live = g.live.load(Ordering::SeqCst);
            let backlog = match broker.pending(&g.spec.queue) {
                Ok(n) => n,
                Err(e) => {
                    debug!("{}: pending: {:#}", g.spec.queue, e);
                    0
                }
            };
            let saturated = g.busy.load(Ordering::SeqCst) >= live;
            if live < g.spec.min || (backlog > 0 && saturated && live < g.spec.max) {
                debug!("{}: scaling up ({} live, {} waiting)", g.spec.queue, live, backlog);
                spawn_consumer(g, &broker, &runner, &shutdown, &opts);
            }
        }
        thread::sleep(opts.tick);
    }

    for g in groups {
        for h in g.consumers {
            let _ = h.join();
        }
    }
}
