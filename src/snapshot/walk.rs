//! Walk loop: consumes an iterator of Ok(entry) / Err and fills the snapshot set, recording skipped paths.

use std::path::PathBuf;
use std::time::Duration;

use crate::{CaseSnapshot, EntryKind, SnapshotEntry};

use super::WalkOpts;

/// One result from a directory walk: either an entry to record or an error with optional path.
pub enum WalkOutcome {
    Ok(PathBuf, Option<EntryKind>),
    Err { msg: String, path: Option<PathBuf> },
}

fn kind_of(ft: std::fs::FileType) -> Option<EntryKind> {
    if ft.is_dir() {
        Some(EntryKind::Directory)
    } else if ft.is_file() {
        Some(EntryKind::File)
    } else {
        None
    }
}

/// Convert a jwalk result into [`WalkOutcome`].
pub fn to_outcome_jwalk(r: Result<jwalk::DirEntry<((), ())>, jwalk::Error>) -> WalkOutcome {
    match r {
        Ok(entry) => WalkOutcome::Ok(entry.path(), kind_of(entry.file_type())),
        Err(err) => WalkOutcome::Err {
            msg: format!("{}", err),
            path: err.path().map(PathBuf::from),
        },
    }
}

/// Convert a walkdir result into [`WalkOutcome`].
pub fn to_outcome_walkdir(r: Result<walkdir::DirEntry, walkdir::Error>) -> WalkOutcome {
    match r {
        Ok(entry) => {
            let kind = kind_of(entry.file_type());
            WalkOutcome::Ok(entry.into_path(), kind)
        }
        Err(err) => WalkOutcome::Err {
            msg: format!("{}", err),
            path: err.path().map(PathBuf::from),
        },
    }
}

pub(crate) fn jwalk_iter(root: &std::path::Path, opts: &WalkOpts) -> Box<dyn Iterator<Item = WalkOutcome>> {
    use jwalk::Parallelism;
    Box::new(
        jwalk::WalkDir::new(root)
            .follow_links(opts.follow_links)
            .skip_hidden(false)
            .parallelism(Parallelism::RayonDefaultPool {
                busy_timeout: Duration::from_secs(60),
            })
            .into_iter()
            .map(to_outcome_jwalk),
    )
}

pub(crate) fn walkdir_iter(root: &std::path::Path, opts: &WalkOpts) -> Box<dyn Iterator<Item = WalkOutcome>> {
    Box::new(
        walkdir::WalkDir::new(root)
            .follow_links(opts.follow_links)
            .into_iter()
            .map(to_outcome_walkdir),
    )
}

/// Run the common walk loop: consume `iter` of [`WalkOutcome`], insert files and directories into
/// `entries`, and push every error (with its path, or a synthetic marker) to `skipped`.
/// Entries that are neither file nor directory (sockets, dangling links) are ignored.
pub fn run_walk_loop<I>(
    iter: I,
    entries: &mut CaseSnapshot,
    skipped: &mut Vec<(PathBuf, String)>,
) -> usize
where
    I: Iterator<Item = WalkOutcome>,
{
    let mut count = 0_usize;
    let mut last_path: Option<PathBuf> = None;
    for outcome in iter {
        match outcome {
            WalkOutcome::Ok(path, kind) => {
                last_path = Some(path.clone());
                if let Some(kind) = kind {
                    entries.insert(SnapshotEntry::new(path, kind));
                    count += 1;
                }
            }
            WalkOutcome::Err { msg, path } => {
                let to_push = path.unwrap_or_else(|| {
                    PathBuf::from(format!(
                        "<no-path, last was {}>",
                        last_path
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "<none>".to_string())
                    ))
                });
                skipped.push((to_push, msg));
            }
        }
    }
    count
}
