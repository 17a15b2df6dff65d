use casewatch::catalog::parse_module;
use casewatch::store::CoordinationStore;
use casewatch::worker::pool::{consumers_within_fd_limit, host_cores};
use casewatch::worker::{
    ModuleHandler, ModuleRegistry, PoolManager, PoolOptions, PoolSpec, ProcessCommandRunner,
    TaskContext, TaskRunner, WorkerSettings, default_pool_table, normalize_pool_table,
};
use casewatch::{
    Broker, CaseContext, ClaimChecker, MemoryBroker, TaskDispatcher, TaskInput, TaskStatus,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// --- pool table ---

#[test]
fn test_default_table_without_disk_only() {
    let table = default_pool_table(false, 3);
    let queues: Vec<&str> = table.iter().map(|s| s.queue.as_str()).collect();
    assert_eq!(
        queues,
        vec![
            "unix_no_multithread",
            "unix_multithread",
            "windows_no_multithread",
            "windows_multithread"
        ]
    );
    assert_eq!(table[0], PoolSpec::new("unix_no_multithread", 1, 1));
    assert_eq!(table[1].max, host_cores());
    assert_eq!(table[3], PoolSpec::new("windows_multithread", 1, 3));
}

#[test]
fn test_default_table_standalone_adds_disk_only() {
    let table = default_pool_table(true, 2);
    assert_eq!(table.len(), 6);
    assert_eq!(table[4], PoolSpec::new("unix_no_multithread_disk_only", 1, 1));
    assert_eq!(table[5].queue, "unix_multithread_disk_only");
    assert_eq!(table[5].min, 2);
    assert!(table[5].max >= 2);
}

#[test]
fn test_normalize_pool_table() {
    let table = normalize_pool_table(&[
        PoolSpec::new("unix_no_multithread", 2, 8),
        PoolSpec::new("unix_multithread", 5, 3),
        PoolSpec::new("windows_multithread", 0, 0),
        PoolSpec::new("unix_multithread", 1, 4),
    ]);
    assert_eq!(
        table,
        vec![
            PoolSpec::new("unix_no_multithread", 1, 1),
            PoolSpec::new("windows_multithread", 0, 1),
            PoolSpec::new("unix_multithread", 1, 4),
        ]
    );
}

#[test]
fn test_host_cores_is_positive() {
    assert!(host_cores() >= 1);
}

#[test]
fn test_fd_limit_splits_across_groups() {
    // 1024 * 4/5 = 816, minus 64 baseline = 752, at 8 per consumer = 94
    assert_eq!(consumers_within_fd_limit(1024, 1), 94);
    assert_eq!(consumers_within_fd_limit(1024, 2), 47);
    assert_eq!(consumers_within_fd_limit(1024, 0), 94);
    // a limit below the baseline still leaves one consumer
    assert_eq!(consumers_within_fd_limit(64, 1), 1);
}

// --- PoolManager ---

struct Slow(Arc<AtomicUsize>);

impl ModuleHandler for Slow {
    fn run(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        std::thread::sleep(Duration::from_millis(50));
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_pool_consumes_queued_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let mut registry = ModuleRegistry::new();
    registry.register("slow", Slow(Arc::clone(&runs)));
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(registry),
        Arc::new(ProcessCommandRunner::default()),
        WorkerSettings {
            claim_poll: Duration::from_millis(10),
            settle_interval: Duration::from_millis(5),
            settle_retry_interval: Duration::from_millis(5),
            agent: "pool-test".to_string(),
        },
    );
    let opts = PoolOptions {
        fetch_timeout: Duration::from_millis(20),
        idle_retire: Duration::from_millis(100),
        tick: Duration::from_millis(10),
    };
    let mut pool = PoolManager::start(
        &[PoolSpec::new("unix_multithread", 1, 3)],
        Arc::clone(&broker),
        Arc::new(runner),
        opts,
    )
    .unwrap();
    assert_eq!(pool.specs().len(), 1);

    let rule = parse_module(
        "processor_type = [\"internal\"]\n[input]\ntype = \"file\"\nname = '.'\n",
        "slow",
    )
    .unwrap();
    let case = CaseContext::new(dir.path(), vec!["slow".to_string()]);
    let dispatcher = TaskDispatcher::new(Arc::clone(&store), Arc::clone(&broker), "watcher");
    for i in 0..6 {
        let input = TaskInput::File(dir.path().join(format!("f{}", i)));
        dispatcher.dispatch(&rule, input, &case).unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || runs.load(Ordering::SeqCst) == 6));
    assert!(wait_for(Duration::from_secs(5), || {
        !store.has_outstanding_work(&case.case_id).unwrap()
    }));
    pool.shutdown();

    let rows = store.task_rows("slow", &case.case_id).unwrap();
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|r| r.status == TaskStatus::ProcessingDone));
}

#[test]
fn test_pool_shutdown_flag_stops_pool() {
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(ModuleRegistry::new()),
        Arc::new(ProcessCommandRunner::default()),
        WorkerSettings::default(),
    );
    let opts = PoolOptions {
        fetch_timeout: Duration::from_millis(20),
        idle_retire: Duration::from_secs(1),
        tick: Duration::from_millis(10),
    };
    let mut pool = PoolManager::start(
        &default_pool_table(false, 2),
        Arc::clone(&broker),
        Arc::new(runner),
        opts,
    )
    .unwrap();
    // every queue of the table is declared
    assert!(broker.submit("windows_multithread", "x").is_ok());

    let flag = pool.shutdown_flag();
    let start = Instant::now();
    flag.store(true, Ordering::SeqCst);
    pool.wait();
    assert!(start.elapsed() < Duration::from_secs(5));
}

/// Every input is held by someone else.
struct AlwaysClaimed;

impl ClaimChecker for AlwaysClaimed {
    fn is_claimed(&self, _case_id: &str, _input: &TaskInput) -> anyhow::Result<bool> {
        Ok(true)
    }
}

#[test]
fn test_shutdown_puts_waiting_task_back_on_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(ModuleRegistry::new()),
        Arc::new(ProcessCommandRunner::default()),
        WorkerSettings {
            claim_poll: Duration::from_millis(10),
            ..WorkerSettings::default()
        },
    )
    .with_claim_checker(Arc::new(AlwaysClaimed));
    let mut pool = PoolManager::start(
        &[PoolSpec::new("unix_multithread", 1, 1)],
        Arc::clone(&broker),
        Arc::new(runner),
        PoolOptions {
            fetch_timeout: Duration::from_millis(20),
            idle_retire: Duration::from_secs(1),
            tick: Duration::from_millis(10),
        },
    )
    .unwrap();

    let rule = parse_module(
        "processor_type = [\"internal\"]\n[input]\ntype = \"file\"\nname = '.'\n",
        "held",
    )
    .unwrap();
    let case = CaseContext::new(dir.path(), vec!["held".to_string()]);
    let dispatcher = TaskDispatcher::new(Arc::clone(&store), Arc::clone(&broker), "watcher");
    dispatcher
        .dispatch(&rule, TaskInput::File(dir.path().join("f")), &case)
        .unwrap();

    // the consumer took it and sits in the claim wait
    assert!(wait_for(Duration::from_secs(5), || {
        broker.pending("unix_multithread").unwrap() == 0
    }));
    pool.shutdown();

    assert_eq!(broker.pending("unix_multithread").unwrap(), 1);
    let rows = store.task_rows("held", &case.case_id).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TaskStatus::TaskCreated);
}
