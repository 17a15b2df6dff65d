use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use crate::{CaseStatus, MasterStatus};

use super::CoordinationStore;

impl CoordinationStore {
    /// Insert or replace the status row of `case_path`.
    pub fn upsert_master_status(
        &self,
        case_path: &str,
        status: CaseStatus,
        case_id: &str,
        modules: &[String],
    ) -> Result<()> {
        let modules_json = serde_json::to_string(modules).context("encode module list")?;
        self.conn()
            .execute(
                r#"INSERT INTO master_status (case_path, status, case_id, modules_selected, timestamp)
                   VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
                   ON CONFLICT(case_path) DO UPDATE SET
                       status = excluded.status,
                       case_id = excluded.case_id,
                       modules_selected = excluded.modules_selected,
                       timestamp = excluded.timestamp"#,
                params![case_path, status.as_str(), case_id, modules_json],
            )
            .context("upsert master status")?;
        Ok(())
    }

    pub fn master_status(&self, case_path: &str) -> Result<Option<MasterStatus>> {
        let row = self
            .conn()
            .query_row(
                "SELECT case_path, status, case_id, modules_selected, timestamp
                 FROM master_status WHERE case_path = ?1",
                [case_path],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("read master status")?;
        let Some((case_path, status, case_id, modules, timestamp)) = row else {
            return Ok(None);
        };
        let status = CaseStatus::parse(&status)
            .with_context(|| format!("unknown case status {:?}", status))?;
        let modules_selected: Vec<String> =
            serde_json::from_str(&modules).context("decode module list")?;
        Ok(Some(MasterStatus {
            case_path,
            status,
            case_id,
            modules_selected,
            timestamp,
        }))
    }
}
