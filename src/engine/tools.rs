//! Path and string utilities

use std::path::{Component, Path, PathBuf};

/// Convert absolute path to relative path from base
pub fn path_relative_to(path: &Path, base: &Path) -> Option<PathBuf> {
    path.strip_prefix(base).ok().map(|p| p.to_path_buf())
}

/// Path as a `/`-separated string for pattern matching. Backslashes become `/`.
pub fn path_to_match_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Parent directory of `path` as a match string ("" when there is none).
pub fn parent_match_string(path: &Path) -> String {
    path.parent().map(path_to_match_string).unwrap_or_default()
}

/// Basename of `path` ("" when there is none).
pub fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Case-insensitive `ends_with`.
pub fn ends_with_ci(text: &str, suffix: &str) -> bool {
    text.to_lowercase().ends_with(&suffix.to_lowercase())
}

/// True if `ancestor` is a strict filesystem ancestor of `path` (component-wise, lexical).
pub fn is_strict_ancestor(ancestor: &Path, path: &Path) -> bool {
    let a = normalize_lexically(ancestor);
    let p = normalize_lexically(path);
    a != p && p.starts_with(&a)
}

/// Drop `.` components and resolve `..` against preceding normal components.
/// Does not touch the filesystem, so it works on paths that were already removed.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(comp.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Truncate `s` to at most `max_bytes` bytes on a char boundary.
pub fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Mtime of `meta` in nanoseconds since the epoch (0 when unavailable).
pub fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
