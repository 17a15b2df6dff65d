//! Size and write-activity meters.

use std::path::Path;

use crate::engine::tools::mtime_ns;

/// Recursive sum of file sizes under `path`. Files that vanish during the walk count as 0.
pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|r| r.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Size and modification time of a file at one instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileSignature {
    pub size: u64,
    pub mtime_ns: i64,
}

/// Current signature of `path`, or `None` if it cannot be read (e.g. already removed).
pub fn file_signature(path: &Path) -> Option<FileSignature> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileSignature {
        size: meta.len(),
        mtime_ns: mtime_ns(&meta),
    })
}
