//! Persisted case snapshots: what the watch loop had seen when it last finished.

use anyhow::{Context, Result};
use log::{debug, warn};
use rusqlite::params;
use std::path::PathBuf;

use crate::{CaseSnapshot, EntryKind, SnapshotEntry};

use super::CoordinationStore;

const INSERT_SNAPSHOT_SQL: &str =
    "INSERT OR REPLACE INTO case_snapshot (case_id, case_path, path, entry_type) VALUES (?1, ?2, ?3, ?4)";

impl CoordinationStore {
    /// Entries last persisted for `case_path` (empty if none).
    pub fn get_snapshot(&self, case_path: &str) -> Result<CaseSnapshot> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT path, entry_type FROM case_snapshot WHERE case_path = ?1")
            .context("prepare snapshot read")?;
        let rows = stmt.query_map([case_path], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = CaseSnapshot::new();
        for row in rows {
            let (path, kind) = row?;
            match EntryKind::parse(&kind) {
                Some(kind) => {
                    out.insert(SnapshotEntry::new(PathBuf::from(path), kind));
                }
                None => debug!("snapshot row {} has unknown entry_type {:?}", path, kind),
            }
        }
        Ok(out)
    }

    /// Replace the snapshot of this case with `entries` in one transaction. Rows stored by
    /// earlier runs of the same case path go too. Paths containing a backslash are skipped.
    /// Returns the number of rows written.
    pub fn put_snapshot(
        &self,
        case_id: &str,
        case_path: &str,
        entries: &CaseSnapshot,
    ) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("begin transaction")?;
        tx.execute(
            "DELETE FROM case_snapshot WHERE case_id = ?1 OR case_path = ?2",
            params![case_id, case_path],
        )
        .context("clear snapshot")?;

        let mut written = 0_usize;
        let mut skipped = Vec::new();
        {
            let mut stmt = tx.prepare(INSERT_SNAPSHOT_SQL).context("prepare insert")?;
            for e in entries {
                let path = e.path.to_string_lossy();
                if path.contains('\\') {
                    skipped.push(path.into_owned());
                    continue;
                }
                stmt.execute(params![case_id, case_path, &*path, e.kind.as_str()])
                    .context("insert snapshot row")?;
                written += 1;
            }
        }
        tx.commit().context("commit transaction")?;

        if !skipped.is_empty() {
            warn!(
                "Snapshot of {}: skipped {} paths containing '\\'",
                case_path,
                skipped.len()
            );
            for p in &skipped {
                debug!("  skipped: {}", p);
            }
        }
        Ok(written)
    }
}
