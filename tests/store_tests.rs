use casewatch::store::{CoordinationStore, is_reserved_table, is_valid_identifier};
use casewatch::{
    CaseContext, CaseSnapshot, CaseStatus, ClaimChecker, SnapshotEntry, TaskInput, TaskRecord,
    TaskStatus,
};
use std::path::PathBuf;

fn case() -> CaseContext {
    CaseContext::new("/cases/c1", vec!["evtx".to_string(), "users".to_string()])
}

fn record(store: &CoordinationStore, module: &str, case: &CaseContext, input: &TaskInput) -> i64 {
    store
        .record_task(module, &TaskRecord::created(case, "agent-1", input))
        .unwrap()
}

// --- identifiers ---

#[test]
fn test_identifiers() {
    assert!(is_valid_identifier("evtx"));
    assert!(is_valid_identifier("_x9"));
    assert!(!is_valid_identifier("9x"));
    assert!(!is_valid_identifier("a-b"));
    assert!(!is_valid_identifier("a\"b"));
    assert!(!is_valid_identifier(""));
    assert!(is_reserved_table("master_status"));
    assert!(is_reserved_table("TASK_QUEUE"));
    assert!(is_reserved_table("sqlite_master"));
    assert!(!is_reserved_table("evtx"));
}

#[test]
fn test_ensure_module_table_rejects_invalid_names() {
    let store = CoordinationStore::open_in_memory().unwrap();
    assert!(store.ensure_module_table("case_snapshot").is_err());
    assert!(store.ensure_module_table("x; DROP TABLE y").is_err());
    store.ensure_module_table("evtx").unwrap();
    store.ensure_module_table("evtx").unwrap();
    assert_eq!(store.module_tables().unwrap(), vec!["evtx"]);
}

// --- task rows ---

#[test]
fn test_record_and_read_rows() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let c = case();
    let input = TaskInput::File(PathBuf::from("/cases/c1/h/System.evtx"));
    let id = record(&store, "evtx", &c, &input);

    let rows = store.task_rows("evtx", &c.case_id).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, Some(id));
    assert_eq!(rows[0].status, TaskStatus::TaskCreated);
    assert_eq!(rows[0].input_file, "/cases/c1/h/System.evtx");
    assert_eq!(rows[0].input_dir, "");
    assert_eq!(rows[0].agent, "agent-1");
    assert!(rows[0].timestamp.is_some());
}

#[test]
fn test_update_task_transitions_in_order() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let c = case();
    let input = TaskInput::File(PathBuf::from("/cases/c1/h/System.evtx"));
    record(&store, "evtx", &c, &input);

    // done before started: nothing moves
    assert_eq!(
        store
            .update_task("evtx", &c.case_id, &input, TaskStatus::ProcessingDone)
            .unwrap(),
        0
    );
    assert_eq!(
        store
            .update_task("evtx", &c.case_id, &input, TaskStatus::ProcessingStarted)
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .update_task("evtx", &c.case_id, &input, TaskStatus::ProcessingDone)
            .unwrap(),
        1
    );
    // a finished row is never reopened
    assert_eq!(
        store
            .update_task("evtx", &c.case_id, &input, TaskStatus::ProcessingStarted)
            .unwrap(),
        0
    );
    let rows = store.task_rows("evtx", &c.case_id).unwrap();
    assert_eq!(rows[0].status, TaskStatus::ProcessingDone);
}

#[test]
fn test_update_task_moves_oldest_row_only() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let c = case();
    let input = TaskInput::File(PathBuf::from("/cases/c1/a.evtx"));
    let first = record(&store, "evtx", &c, &input);
    record(&store, "evtx", &c, &input);

    store
        .update_task("evtx", &c.case_id, &input, TaskStatus::ProcessingStarted)
        .unwrap();
    let rows = store.task_rows("evtx", &c.case_id).unwrap();
    assert_eq!(rows[0].id, Some(first));
    assert_eq!(rows[0].status, TaskStatus::ProcessingStarted);
    assert_eq!(rows[1].status, TaskStatus::TaskCreated);
}

#[test]
fn test_retract_task() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let c = case();
    let input = TaskInput::File(PathBuf::from("/cases/c1/a.evtx"));
    let id = record(&store, "evtx", &c, &input);
    store.retract_task("evtx", id).unwrap();
    assert!(store.task_rows("evtx", &c.case_id).unwrap().is_empty());
    assert!(!store.has_outstanding_work(&c.case_id).unwrap());
}

// --- claims ---

#[test]
fn test_claimed_only_while_started() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let c = case();
    let input = TaskInput::File(PathBuf::from("/cases/c1/a.evtx"));
    record(&store, "evtx", &c, &input);
    assert!(!store.is_input_claimed(&c.case_id, &input).unwrap());

    store
        .update_task("evtx", &c.case_id, &input, TaskStatus::ProcessingStarted)
        .unwrap();
    assert!(store.is_input_claimed(&c.case_id, &input).unwrap());
    assert!(store.is_claimed(&c.case_id, &input).unwrap());

    store
        .update_task("evtx", &c.case_id, &input, TaskStatus::ProcessingDone)
        .unwrap();
    assert!(!store.is_input_claimed(&c.case_id, &input).unwrap());
}

#[test]
fn test_claim_spans_module_tables() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let c = case();
    let input = TaskInput::File(PathBuf::from("/cases/c1/a.evtx"));
    record(&store, "evtx", &c, &input);
    store
        .update_task("evtx", &c.case_id, &input, TaskStatus::ProcessingStarted)
        .unwrap();
    store.ensure_module_table("hayabusa").unwrap();
    assert!(store.is_input_claimed(&c.case_id, &input).unwrap());
}

#[test]
fn test_claim_is_per_case_id() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let c = case();
    let input = TaskInput::File(PathBuf::from("/cases/c1/a.evtx"));
    record(&store, "evtx", &c, &input);
    store
        .update_task("evtx", &c.case_id, &input, TaskStatus::ProcessingStarted)
        .unwrap();
    assert!(!store.is_input_claimed("other-case", &input).unwrap());
}

#[test]
fn test_directory_claimed_by_work_below_it() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let c = case();
    let file = TaskInput::File(PathBuf::from("/cases/c1/Users/alice/ntuser.dat"));
    record(&store, "evtx", &c, &file);
    store
        .update_task("evtx", &c.case_id, &file, TaskStatus::ProcessingStarted)
        .unwrap();

    let parent = TaskInput::Dir(PathBuf::from("/cases/c1/Users/alice"));
    let sibling = TaskInput::Dir(PathBuf::from("/cases/c1/Users/al"));
    assert!(store.is_input_claimed(&c.case_id, &parent).unwrap());
    assert!(!store.is_input_claimed(&c.case_id, &sibling).unwrap());

    let dir = TaskInput::Dir(PathBuf::from("/cases/c1/Users/bob/Library"));
    record(&store, "users", &c, &dir);
    store
        .update_task("users", &c.case_id, &dir, TaskStatus::ProcessingStarted)
        .unwrap();
    assert!(
        store
            .is_input_claimed(&c.case_id, &TaskInput::Dir(PathBuf::from("/cases/c1/Users/bob")))
            .unwrap()
    );
    assert!(store.is_input_claimed(&c.case_id, &dir).unwrap());
}

// --- outstanding work ---

#[test]
fn test_outstanding_work() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let c = case();
    assert!(!store.has_outstanding_work(&c.case_id).unwrap());

    let a = TaskInput::File(PathBuf::from("/cases/c1/a.evtx"));
    let b = TaskInput::Dir(PathBuf::from("/cases/c1/Users/bob"));
    record(&store, "evtx", &c, &a);
    record(&store, "users", &c, &b);
    assert!(store.has_outstanding_work(&c.case_id).unwrap());
    assert_eq!(
        store.outstanding_counts(&c.case_id).unwrap(),
        vec![("evtx".to_string(), 1), ("users".to_string(), 1)]
    );

    for (module, input) in [("evtx", &a), ("users", &b)] {
        store
            .update_task(module, &c.case_id, input, TaskStatus::ProcessingStarted)
            .unwrap();
        store
            .update_task(module, &c.case_id, input, TaskStatus::ProcessingDone)
            .unwrap();
    }
    assert!(!store.has_outstanding_work(&c.case_id).unwrap());
    assert!(store.outstanding_counts(&c.case_id).unwrap().is_empty());
}

// --- snapshots ---

#[test]
fn test_snapshot_round_trip_skips_backslash_paths() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let mut snap = CaseSnapshot::new();
    snap.insert(SnapshotEntry::dir("/cases/c1"));
    snap.insert(SnapshotEntry::dir("/cases/c1/h"));
    snap.insert(SnapshotEntry::file("/cases/c1/h/a.evtx"));
    snap.insert(SnapshotEntry::file("/cases/c1/h/odd\\name.txt"));

    let written = store.put_snapshot("c1-id", "/cases/c1", &snap).unwrap();
    assert_eq!(written, 3);

    let loaded = store.get_snapshot("/cases/c1").unwrap();
    let mut expected = snap.clone();
    expected.remove(&SnapshotEntry::file("/cases/c1/h/odd\\name.txt"));
    assert_eq!(loaded, expected);
    assert!(store.get_snapshot("/cases/other").unwrap().is_empty());
}

#[test]
fn test_snapshot_replaced_by_later_run() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let mut first = CaseSnapshot::new();
    first.insert(SnapshotEntry::dir("/cases/c1"));
    first.insert(SnapshotEntry::file("/cases/c1/gone.txt"));
    store.put_snapshot("run-1", "/cases/c1", &first).unwrap();

    let mut second = CaseSnapshot::new();
    second.insert(SnapshotEntry::dir("/cases/c1"));
    second.insert(SnapshotEntry::file("/cases/c1/new.txt"));
    store.put_snapshot("run-2", "/cases/c1", &second).unwrap();

    assert_eq!(store.get_snapshot("/cases/c1").unwrap(), second);
}

// --- master status ---

#[test]
fn test_master_status_upsert() {
    let store = CoordinationStore::open_in_memory().unwrap();
    let c = case();
    assert!(store.master_status("/cases/c1").unwrap().is_none());

    store
        .upsert_master_status("/cases/c1", CaseStatus::ProcessingCase, &c.case_id, &c.modules)
        .unwrap();
    let s = store.master_status("/cases/c1").unwrap().unwrap();
    assert_eq!(s.status, CaseStatus::ProcessingCase);
    assert_eq!(s.case_id, c.case_id);
    assert_eq!(s.modules_selected, vec!["evtx", "users"]);

    store
        .upsert_master_status("/cases/c1", CaseStatus::ProcessingDone, "next-id", &[])
        .unwrap();
    let s = store.master_status("/cases/c1").unwrap().unwrap();
    assert_eq!(s.status, CaseStatus::ProcessingDone);
    assert_eq!(s.case_id, "next-id");
    assert!(s.modules_selected.is_empty());
}

// --- file-backed store ---

#[test]
fn test_two_handles_share_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("casewatch.db");
    let a = CoordinationStore::open(&path).unwrap();
    let b = CoordinationStore::open(&path).unwrap();
    let c = case();
    let input = TaskInput::File(PathBuf::from("/cases/c1/a.evtx"));
    record(&a, "evtx", &c, &input);
    a.update_task("evtx", &c.case_id, &input, TaskStatus::ProcessingStarted)
        .unwrap();
    assert!(b.is_input_claimed(&c.case_id, &input).unwrap());
    assert_eq!(b.module_tables().unwrap(), vec!["evtx"]);
}

#[test]
fn test_case_id_has_basename_prefix() {
    let c = case();
    assert!(c.case_id.starts_with("c1-"));
    assert_eq!(c.case_id.len(), "c1-".len() + 36);
    assert_ne!(c.case_id, case().case_id);
}
