//! Tree snapshots: walk a case tree into a set of `(path, kind)` entries, plus the size
//! meters used to decide when a directory or file has stopped growing.

pub mod size;
pub mod walk;

pub use size::{FileSignature, dir_size, file_signature};
pub use walk::{WalkOutcome, run_walk_loop, to_outcome_jwalk, to_outcome_walkdir};

use anyhow::{Context, Result};
use log::{debug, warn};
use std::path::Path;

use crate::CaseSnapshot;

/// Walk options for [`scan`].
#[derive(Clone, Debug, Default)]
pub struct WalkOpts {
    /// Walk with jwalk on the rayon pool instead of a serial walkdir.
    pub parallel_walk: bool,
    /// Follow symbolic links. When off, links are neither files nor directories and are skipped.
    pub follow_links: bool,
}

/// Scan `root` depth-first and return every file and directory under it, `root` included.
///
/// Entries that vanish or cannot be read mid-walk are skipped with a warning; only an
/// unreadable `root` fails the scan.
pub fn scan(root: &Path, opts: &WalkOpts) -> Result<CaseSnapshot> {
    let meta = std::fs::metadata(root)
        .with_context(|| format!("read case root {}", root.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("case root is not a directory: {}", root.display());
    }

    let iter = match opts.parallel_walk {
        true => walk::jwalk_iter(root, opts),
        false => walk::walkdir_iter(root, opts),
    };
    let mut entries = CaseSnapshot::new();
    let mut skipped = Vec::new();
    let count = run_walk_loop(iter, &mut entries, &mut skipped);

    if !skipped.is_empty() {
        warn!(
            "Skipped {} paths under {} (vanished or unreadable)",
            skipped.len(),
            root.display()
        );
        for (p, msg) in &skipped {
            debug!("  skipped: {} ({})", p.display(), msg);
        }
    }
    debug!("scan {}: {} entries", root.display(), count);
    Ok(entries)
}
