use anyhow::Result;
use casewatch::catalog::{ToolSpec, parse_module};
use casewatch::store::CoordinationStore;
use casewatch::worker::{
    CommandOutcome, CommandRunner, Execution, ModuleHandler, ModuleRegistry, ProcessCommandRunner,
    TaskContext, TaskReport, TaskRunner, WorkerSettings,
};
use casewatch::{
    Broker, CaseContext, ClaimChecker, MemoryBroker, ModuleRule, TaskDispatcher, TaskInput,
    TaskStatus,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const QUEUE: &str = "unix_multithread";

fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        claim_poll: Duration::from_millis(10),
        settle_interval: Duration::from_millis(10),
        settle_retry_interval: Duration::from_millis(10),
        agent: "test-agent".to_string(),
    }
}

fn internal_rule(name: &str) -> ModuleRule {
    parse_module(
        "processor_type = [\"internal\"]\n[input]\ntype = \"file\"\nname = '.'\n",
        name,
    )
    .unwrap()
}

fn external_rule() -> ModuleRule {
    parse_module(
        "processor_type = [\"external\"]\n[input]\ntype = \"file\"\nname = '.'\n[tool]\npath = \"tool\"\ncmd = \"{input}\"\n",
        "ext",
    )
    .unwrap()
}

/// Dispatch `input` for `rule` and hand back the encoded payload as a consumer would see it.
fn queued_payload(
    store: &Arc<CoordinationStore>,
    rule: &ModuleRule,
    case: &CaseContext,
    input: TaskInput,
) -> String {
    let broker = Arc::new(MemoryBroker::new());
    broker.declare(QUEUE).unwrap();
    TaskDispatcher::new(Arc::clone(store), broker.clone(), "watcher")
        .dispatch(rule, input, case)
        .unwrap();
    broker.fetch(QUEUE, Duration::from_millis(50)).unwrap().unwrap()
}

fn finished(e: Execution) -> TaskReport {
    match e {
        Execution::Finished(report) => report,
        Execution::Interrupted => panic!("task was interrupted"),
    }
}

struct FixedOutcome(Option<i32>);

impl CommandRunner for FixedOutcome {
    fn run(&self, _ctx: &TaskContext, _tool: &ToolSpec) -> Result<CommandOutcome> {
        Ok(CommandOutcome {
            exit_code: self.0,
            ..Default::default()
        })
    }
}

/// Claimed for the first `n` checks.
struct ClaimedFor {
    n: usize,
    calls: AtomicUsize,
}

impl ClaimChecker for ClaimedFor {
    fn is_claimed(&self, _case_id: &str, _input: &TaskInput) -> Result<bool> {
        Ok(self.calls.fetch_add(1, Ordering::SeqCst) < self.n)
    }
}

struct FailingClaims;

impl ClaimChecker for FailingClaims {
    fn is_claimed(&self, _case_id: &str, _input: &TaskInput) -> Result<bool> {
        anyhow::bail!("store locked")
    }
}

struct Counting(Arc<AtomicUsize>);

impl ModuleHandler for Counting {
    fn run(&self, ctx: &TaskContext) -> Result<()> {
        assert_eq!(ctx.agent, "test-agent");
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Raises the cancel flag mid-run, then keeps working.
struct RaiseThenWait(Arc<AtomicBool>);

impl ModuleHandler for RaiseThenWait {
    fn run(&self, _ctx: &TaskContext) -> Result<()> {
        self.0.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        Ok(())
    }
}

fn case_with_file(dir: &Path) -> (CaseContext, TaskInput) {
    let file = dir.join("host1").join("a.log");
    fs::create_dir_all(file.parent().unwrap()).unwrap();
    fs::write(&file, b"hello").unwrap();
    (
        CaseContext::new(dir, vec!["count".to_string()]),
        TaskInput::File(file),
    )
}

// --- internal handlers ---

#[test]
fn test_internal_handler_runs_and_row_completes() {
    let dir = tempfile::tempdir().unwrap();
    let (case, input) = case_with_file(dir.path());
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let rule = internal_rule("count");
    let payload = queued_payload(&store, &rule, &case, input);

    let runs = Arc::new(AtomicUsize::new(0));
    let mut registry = ModuleRegistry::new();
    registry.register("count", Counting(Arc::clone(&runs)));
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(registry),
        Arc::new(FixedOutcome(Some(0))),
        fast_settings(),
    );

    let report = finished(runner.execute(&payload, &AtomicBool::new(false)).unwrap());
    assert!(report.succeeded);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let rows = store.task_rows("count", &case.case_id).unwrap();
    assert_eq!(rows[0].status, TaskStatus::ProcessingDone);
    assert!(!store.has_outstanding_work(&case.case_id).unwrap());
}

#[test]
fn test_missing_handler_still_marks_done() {
    let dir = tempfile::tempdir().unwrap();
    let (case, input) = case_with_file(dir.path());
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let payload = queued_payload(&store, &internal_rule("unknown"), &case, input);
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(ModuleRegistry::new()),
        Arc::new(FixedOutcome(Some(0))),
        fast_settings(),
    );

    let report = finished(runner.execute(&payload, &AtomicBool::new(false)).unwrap());
    assert!(!report.succeeded);
    let rows = store.task_rows("unknown", &case.case_id).unwrap();
    assert_eq!(rows[0].status, TaskStatus::ProcessingDone);
}

#[test]
fn test_manifest_builtin_writes_digest() {
    let dir = tempfile::tempdir().unwrap();
    let (case, input) = case_with_file(dir.path());
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let payload = queued_payload(&store, &internal_rule("manifest"), &case, input.clone());
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(ModuleRegistry::with_builtins()),
        Arc::new(FixedOutcome(Some(0))),
        fast_settings(),
    );

    assert!(finished(runner.execute(&payload, &AtomicBool::new(false)).unwrap()).succeeded);
    let text = fs::read_to_string(dir.path().join("manifest").join("manifest.b3")).unwrap();
    let expected = blake3::hash(b"hello").to_hex();
    assert_eq!(
        text,
        format!("{}  {}\n", expected, input.path().display())
    );
}

#[test]
fn test_registry_names() {
    let r = ModuleRegistry::with_builtins();
    assert_eq!(r.names(), vec!["manifest"]);
    assert!(r.get("manifest").is_some());
    assert!(r.get("nope").is_none());
}

// --- external modules ---

#[test]
fn test_external_failure_is_reported_and_marked_done() {
    let dir = tempfile::tempdir().unwrap();
    let (case, input) = case_with_file(dir.path());
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let payload = queued_payload(&store, &external_rule(), &case, input);
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(ModuleRegistry::new()),
        Arc::new(FixedOutcome(Some(2))),
        fast_settings(),
    );

    let report = finished(runner.execute(&payload, &AtomicBool::new(false)).unwrap());
    assert!(!report.succeeded);
    assert_eq!(report.module, "ext");
    let rows = store.task_rows("ext", &case.case_id).unwrap();
    assert_eq!(rows[0].status, TaskStatus::ProcessingDone);
}

// --- claim wait ---

#[test]
fn test_waits_until_input_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let (case, input) = case_with_file(dir.path());
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let payload = queued_payload(&store, &external_rule(), &case, input);
    let claims = Arc::new(ClaimedFor {
        n: 3,
        calls: AtomicUsize::new(0),
    });
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(ModuleRegistry::new()),
        Arc::new(FixedOutcome(Some(0))),
        fast_settings(),
    )
    .with_claim_checker(claims.clone());

    assert!(finished(runner.execute(&payload, &AtomicBool::new(false)).unwrap()).succeeded);
    assert_eq!(claims.calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_cancel_during_claim_wait_interrupts_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let (case, input) = case_with_file(dir.path());
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let payload = queued_payload(&store, &external_rule(), &case, input);
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(ModuleRegistry::new()),
        Arc::new(FixedOutcome(Some(0))),
        fast_settings(),
    )
    .with_claim_checker(Arc::new(FailingClaims));

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let t = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(60));
        flag.store(true, Ordering::SeqCst);
    });
    let outcome = runner.execute(&payload, &cancel).unwrap();
    t.join().unwrap();
    assert!(matches!(outcome, Execution::Interrupted));
    // never started, so a later run of the same payload can still claim it
    let rows = store.task_rows("ext", &case.case_id).unwrap();
    assert_eq!(rows[0].status, TaskStatus::TaskCreated);
}

#[test]
fn test_cancel_after_start_still_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let (case, input) = case_with_file(dir.path());
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let payload = queued_payload(&store, &internal_rule("slow"), &case, input);

    let cancel = Arc::new(AtomicBool::new(false));
    let mut registry = ModuleRegistry::new();
    registry.register("slow", RaiseThenWait(Arc::clone(&cancel)));
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(registry),
        Arc::new(FixedOutcome(Some(0))),
        fast_settings(),
    );

    assert!(finished(runner.execute(&payload, &cancel).unwrap()).succeeded);
    let rows = store.task_rows("slow", &case.case_id).unwrap();
    assert_eq!(rows[0].status, TaskStatus::ProcessingDone);
}

/// Records the input size and the time it saw it.
struct SizeAtRun(Arc<std::sync::Mutex<Option<(u64, std::time::Instant)>>>);

impl ModuleHandler for SizeAtRun {
    fn run(&self, ctx: &TaskContext) -> Result<()> {
        let size = fs::metadata(ctx.input.path())?.len();
        *self.0.lock().unwrap() = Some((size, std::time::Instant::now()));
        Ok(())
    }
}

#[test]
fn test_runs_only_after_writes_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (case, input) = case_with_file(dir.path());
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let payload = queued_payload(&store, &internal_rule("sized"), &case, input.clone());

    let seen = Arc::new(std::sync::Mutex::new(None));
    let mut registry = ModuleRegistry::new();
    registry.register("sized", SizeAtRun(Arc::clone(&seen)));
    // samples are further apart than writes, so every sample during the writes differs
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(registry),
        Arc::new(FixedOutcome(Some(0))),
        WorkerSettings {
            settle_interval: Duration::from_millis(40),
            settle_retry_interval: Duration::from_millis(40),
            ..fast_settings()
        },
    );

    let path = input.path().to_path_buf();
    let writer = std::thread::spawn(move || {
        use std::io::Write;
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        for _ in 0..20 {
            f.write_all(&[b'x'; 10]).unwrap();
            f.flush().unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        std::time::Instant::now()
    });

    assert!(finished(runner.execute(&payload, &AtomicBool::new(false)).unwrap()).succeeded);
    let writes_done = writer.join().unwrap();
    let (size, at) = seen.lock().unwrap().unwrap();
    assert_eq!(size, 5 + 200);
    assert!(at >= writes_done);
}

#[test]
fn test_vanished_input_counts_as_settled() {
    let dir = tempfile::tempdir().unwrap();
    let (case, input) = case_with_file(dir.path());
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let payload = queued_payload(&store, &external_rule(), &case, input.clone());
    fs::remove_file(input.path()).unwrap();
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(ModuleRegistry::new()),
        Arc::new(FixedOutcome(Some(0))),
        fast_settings(),
    );
    assert!(finished(runner.execute(&payload, &AtomicBool::new(false)).unwrap()).succeeded);
}

#[test]
fn test_bad_payload_is_an_error() {
    let store = Arc::new(CoordinationStore::open_in_memory().unwrap());
    let runner = TaskRunner::new(
        store,
        Arc::new(ModuleRegistry::new()),
        Arc::new(FixedOutcome(Some(0))),
        fast_settings(),
    );
    assert!(runner.execute("garbage", &AtomicBool::new(false)).is_err());
}

// --- ProcessCommandRunner ---

#[cfg(unix)]
fn shell_ctx(dir: &Path, cmd: &str, timeout: Option<u64>) -> (TaskContext, ToolSpec) {
    let (case, input) = case_with_file(dir);
    let rule = external_rule();
    let output = casewatch::naming::render_output(&rule, &case.case_path, &input);
    let tool = ToolSpec {
        path: "sh".to_string(),
        cmd: cmd.to_string(),
        env: vec!["CW_GREETING=hi".to_string()],
        timeout_secs: timeout,
    };
    let ctx = TaskContext {
        case_id: case.case_id,
        case_path: case.case_path,
        module: rule,
        input,
        output,
        agent: "a".to_string(),
    };
    (ctx, tool)
}

#[cfg(unix)]
#[test]
fn test_shell_runner_runs_in_output_dir_with_env() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, tool) = shell_ctx(
        dir.path(),
        "-c 'echo \"$CW_GREETING {input_file}\" > out.txt; cat {input}'",
        None,
    );
    let outcome = ProcessCommandRunner::default().run(&ctx, &tool).unwrap();
    assert!(outcome.success());
    assert_eq!(outcome.stdout, "hello");
    let written = fs::read_to_string(ctx.output.output_dir.join("out.txt")).unwrap();
    assert_eq!(written, "hi a.log\n");
}

#[cfg(unix)]
#[test]
fn test_shell_runner_reports_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, tool) = shell_ctx(dir.path(), "-c 'exit 3'", None);
    let outcome = ProcessCommandRunner::default().run(&ctx, &tool).unwrap();
    assert!(!outcome.success());
    assert_eq!(outcome.exit_code, Some(3));
    assert!(!outcome.timed_out);
}

#[cfg(unix)]
#[test]
fn test_shell_runner_kills_on_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, tool) = shell_ctx(dir.path(), "-c 'sleep 5'", None);
    let runner = ProcessCommandRunner::with_timeout(Duration::from_millis(200));
    let start = std::time::Instant::now();
    let outcome = runner.run(&ctx, &tool).unwrap();
    assert!(outcome.timed_out);
    assert!(!outcome.success());
    assert!(start.elapsed() < Duration::from_secs(4));
}

#[cfg(unix)]
#[test]
fn test_process_runner_passes_odd_paths_as_single_argument() {
    let dir = tempfile::tempdir().unwrap();
    let odd_dir = dir.path().join("Program Files");
    fs::create_dir_all(&odd_dir).unwrap();
    let file = odd_dir.join("a b $(touch marker); echo x.log");
    fs::write(&file, b"evidence").unwrap();

    let case = CaseContext::new(dir.path(), vec!["ext".to_string()]);
    let rule = external_rule();
    let input = TaskInput::File(file);
    let output = casewatch::naming::render_output(&rule, &case.case_path, &input);
    let tool = ToolSpec {
        path: "cat".to_string(),
        cmd: "{input}".to_string(),
        ..Default::default()
    };
    let ctx = TaskContext {
        case_id: case.case_id,
        case_path: case.case_path,
        module: rule,
        input,
        output,
        agent: "a".to_string(),
    };

    let outcome = ProcessCommandRunner::default().run(&ctx, &tool).unwrap();
    assert!(outcome.success(), "stderr: {}", outcome.stderr);
    assert_eq!(outcome.stdout, "evidence");
    assert!(!ctx.output.output_dir.join("marker").exists());
    assert!(!dir.path().join("marker").exists());
}
