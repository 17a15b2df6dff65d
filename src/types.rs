//! Public and internal types shared by the watch loop, the store and the workers.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Kind of a filesystem entry as seen by a scan. Stored as `file` / `directory`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(EntryKind::File),
            "directory" => Some(EntryKind::Directory),
            _ => None,
        }
    }
}

/// One `(path, kind)` pair of a case tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

impl SnapshotEntry {
    pub fn new(path: impl Into<PathBuf>, kind: EntryKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(path, EntryKind::File)
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self::new(path, EntryKind::Directory)
    }
}

/// Observed state of a case: every entry of the tree, root included. No ordering.
pub type CaseSnapshot = HashSet<SnapshotEntry>;

/// What a module rule consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    File,
    Dir,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::File => "file",
            InputKind::Dir => "dir",
        }
    }

    /// True when an entry of `kind` can feed a rule of this input kind.
    pub fn accepts(&self, kind: EntryKind) -> bool {
        matches!(
            (self, kind),
            (InputKind::File, EntryKind::File) | (InputKind::Dir, EntryKind::Directory)
        )
    }
}

/// The input a task operates on. Exactly one of file/dir is set on a task row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "path", rename_all = "lowercase")]
pub enum TaskInput {
    File(PathBuf),
    Dir(PathBuf),
}

impl TaskInput {
    pub fn new(kind: InputKind, path: impl Into<PathBuf>) -> Self {
        match kind {
            InputKind::File => TaskInput::File(path.into()),
            InputKind::Dir => TaskInput::Dir(path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            TaskInput::File(p) | TaskInput::Dir(p) => p,
        }
    }

    pub fn kind(&self) -> InputKind {
        match self {
            TaskInput::File(_) => InputKind::File,
            TaskInput::Dir(_) => InputKind::Dir,
        }
    }

    /// Value of the `input_file` column (empty for directory inputs).
    pub fn input_file(&self) -> String {
        match self {
            TaskInput::File(p) => p.to_string_lossy().into_owned(),
            TaskInput::Dir(_) => String::new(),
        }
    }

    /// Value of the `input_dir` column (empty for file inputs).
    pub fn input_dir(&self) -> String {
        match self {
            TaskInput::Dir(p) => p.to_string_lossy().into_owned(),
            TaskInput::File(_) => String::new(),
        }
    }
}

/// Lifecycle of a task row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    TaskCreated,
    ProcessingStarted,
    ProcessingDone,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::TaskCreated => "task_created",
            TaskStatus::ProcessingStarted => "processing_started",
            TaskStatus::ProcessingDone => "processing_done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task_created" => Some(TaskStatus::TaskCreated),
            "processing_started" => Some(TaskStatus::ProcessingStarted),
            "processing_done" => Some(TaskStatus::ProcessingDone),
            _ => None,
        }
    }
}

/// Status of a whole case in `master_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaseStatus {
    ProcessingCase,
    ProcessingDone,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::ProcessingCase => "processing_case",
            CaseStatus::ProcessingDone => "processing_done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing_case" => Some(CaseStatus::ProcessingCase),
            "processing_done" => Some(CaseStatus::ProcessingDone),
            _ => None,
        }
    }
}

/// Identity of a case for one run: a fresh `case_id` per run, stable `case_path`.
#[derive(Clone, Debug)]
pub struct CaseContext {
    pub case_id: String,
    pub case_path: PathBuf,
    pub modules: Vec<String>,
}

impl CaseContext {
    /// New context with a generated id `<basename>-<uuid v4>`.
    pub fn new(case_path: impl Into<PathBuf>, modules: Vec<String>) -> Self {
        let case_path = case_path.into();
        let case_id = generate_case_id(&case_path);
        Self {
            case_id,
            case_path,
            modules,
        }
    }

    pub fn case_path_str(&self) -> String {
        self.case_path.to_string_lossy().into_owned()
    }
}

/// `<basename>-<uuid v4>` for the case at `case_path`.
pub fn generate_case_id(case_path: &Path) -> String {
    let prefix = case_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "case".to_string());
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// One row of a module table. `id` and `timestamp` are filled by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub id: Option<i64>,
    pub case_id: String,
    pub case_path: String,
    pub agent: String,
    pub input_file: String,
    pub input_dir: String,
    pub output_file: String,
    pub output_dir: String,
    pub output_prefix: String,
    pub status: TaskStatus,
    pub timestamp: Option<String>,
}

impl TaskRecord {
    /// Fresh `task_created` record for `input` in `case`.
    pub fn created(case: &CaseContext, agent: &str, input: &TaskInput) -> Self {
        Self {
            id: None,
            case_id: case.case_id.clone(),
            case_path: case.case_path_str(),
            agent: agent.to_string(),
            input_file: input.input_file(),
            input_dir: input.input_dir(),
            output_file: String::new(),
            output_dir: String::new(),
            output_prefix: String::new(),
            status: TaskStatus::TaskCreated,
            timestamp: None,
        }
    }
}

/// One row of `master_status`.
#[derive(Clone, Debug, PartialEq)]
pub struct MasterStatus {
    pub case_path: String,
    pub status: CaseStatus,
    pub case_id: String,
    pub modules_selected: Vec<String>,
    pub timestamp: String,
}
