//! Task rows: record, transition, claim checks.

use anyhow::{Context, Result};
use log::warn;
use rusqlite::{OptionalExtension, params};

use crate::{TaskInput, TaskRecord, TaskStatus};

use super::CoordinationStore;

/// Columns of a module table in select order.
const TASK_COLUMNS: &str = "id, case_id, case_path, agent, input_file, input_dir, output_file, \
     output_dir, output_prefix, processing_status, timestamp";

/// Matches a row by input: a non-empty `input_file` or `input_dir` equal to the given one.
const INPUT_MATCH: &str =
    "((input_file != '' AND input_file = ?2) OR (input_dir != '' AND input_dir = ?3))";

impl TaskRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(9)?;
        let status = TaskStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Text,
                format!("unknown processing_status {:?}", status).into(),
            )
        })?;
        Ok(Self {
            id: Some(row.get(0)?),
            case_id: row.get(1)?,
            case_path: row.get(2)?,
            agent: row.get(3)?,
            input_file: row.get(4)?,
            input_dir: row.get(5)?,
            output_file: row.get(6)?,
            output_dir: row.get(7)?,
            output_prefix: row.get(8)?,
            status,
            timestamp: Some(row.get(10)?),
        })
    }
}

/// Status a row must be in to move to `to`.
fn previous_status(to: TaskStatus) -> Option<TaskStatus> {
    match to {
        TaskStatus::TaskCreated => None,
        TaskStatus::ProcessingStarted => Some(TaskStatus::TaskCreated),
        TaskStatus::ProcessingDone => Some(TaskStatus::ProcessingStarted),
    }
}

impl CoordinationStore {
    /// Insert a row for `module`. Returns its id.
    pub fn record_task(&self, module: &str, record: &TaskRecord) -> Result<i64> {
        self.ensure_module_table(module)?;
        let conn = self.conn();
        conn.execute(
            &format!(
                r#"INSERT INTO "{}" (case_id, case_path, agent, input_file, input_dir,
                    output_file, output_dir, output_prefix, processing_status)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
                module
            ),
            params![
                record.case_id,
                record.case_path,
                record.agent,
                record.input_file,
                record.input_dir,
                record.output_file,
                record.output_dir,
                record.output_prefix,
                record.status.as_str(),
            ],
        )
        .with_context(|| format!("insert task row into {}", module))?;
        Ok(conn.last_insert_rowid())
    }

    /// Delete a row whose task never reached the broker.
    pub fn retract_task(&self, module: &str, id: i64) -> Result<()> {
        self.ensure_module_table(module)?;
        self.conn()
            .execute(&format!(r#"DELETE FROM "{}" WHERE id = ?1"#, module), [id])
            .with_context(|| format!("retract task {} in {}", id, module))?;
        Ok(())
    }

    /// Move the oldest matching row of `(case_id, input)` to `status`. Only rows in the
    /// preceding state move, so a finished row is never reopened. Returns rows changed (0 or 1).
    pub fn update_task(
        &self,
        module: &str,
        case_id: &str,
        input: &TaskInput,
        status: TaskStatus,
    ) -> Result<usize> {
        self.ensure_module_table(module)?;
        let from = previous_status(status).map(|s| s.as_str()).unwrap_or("");
        let sql = format!(
            r#"UPDATE "{m}" SET processing_status = ?4, timestamp = CURRENT_TIMESTAMP
               WHERE id = (
                   SELECT id FROM "{m}"
                   WHERE case_id = ?1 AND {input_match}
                     AND (?5 = '' OR processing_status = ?5)
                   ORDER BY id LIMIT 1
               )"#,
            m = module,
            input_match = INPUT_MATCH
        );
        let n = self
            .conn()
            .execute(
                &sql,
                params![
                    case_id,
                    input.input_file(),
                    input.input_dir(),
                    status.as_str(),
                    from
                ],
            )
            .with_context(|| format!("update task in {}", module))?;
        if n == 0 {
            warn!(
                "{}: no {} row to move to {} for {}",
                module,
                if from.is_empty() { "matching" } else { from },
                status.as_str(),
                input.path().display()
            );
        }
        Ok(n)
    }

    /// True if any module table has a `processing_started` row for `input` in `case_id`.
    /// A directory is also claimed when anything below it is.
    pub fn is_input_claimed(&self, case_id: &str, input: &TaskInput) -> Result<bool> {
        let tables = self.module_tables()?;
        let conn = self.conn();
        for table in &tables {
            let found = match input {
                TaskInput::File(_) => conn
                    .query_row(
                        &format!(
                            r#"SELECT 1 FROM "{}" WHERE case_id = ?1 AND input_file = ?2
                               AND processing_status = 'processing_started' LIMIT 1"#,
                            table
                        ),
                        params![case_id, input.input_file()],
                        |_| Ok(()),
                    )
                    .optional(),
                TaskInput::Dir(_) => {
                    let dir = input.input_dir();
                    let prefix = format!("{}/", dir.trim_end_matches('/'));
                    conn.query_row(
                        &format!(
                            r#"SELECT 1 FROM "{}" WHERE case_id = ?1
                               AND (input_dir = ?2
                                    OR substr(input_dir, 1, length(?3)) = ?3
                                    OR substr(input_file, 1, length(?3)) = ?3)
                               AND processing_status = 'processing_started' LIMIT 1"#,
                            table
                        ),
                        params![case_id, dir, prefix],
                        |_| Ok(()),
                    )
                    .optional()
                }
            }
            .with_context(|| format!("claim check in {}", table))?;
            if found.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True if any module table has a row of `case_id` that is not `processing_done`.
    pub fn has_outstanding_work(&self, case_id: &str) -> Result<bool> {
        Ok(self
            .outstanding_counts(case_id)?
            .iter()
            .any(|(_, n)| *n > 0))
    }

    /// Non-done row count per module table for `case_id` (tables with none are omitted).
    pub fn outstanding_counts(&self, case_id: &str) -> Result<Vec<(String, usize)>> {
        let tables = self.module_tables()?;
        let conn = self.conn();
        let mut out = Vec::new();
        for table in tables {
            let n: i64 = conn
                .query_row(
                    &format!(
                        r#"SELECT COUNT(*) FROM "{}" WHERE case_id = ?1
                           AND processing_status != 'processing_done'"#,
                        table
                    ),
                    [case_id],
                    |row| row.get(0),
                )
                .with_context(|| format!("count outstanding in {}", table))?;
            if n > 0 {
                out.push((table, n as usize));
            }
        }
        Ok(out)
    }

    /// All rows of `module` for `case_id`, oldest first.
    pub fn task_rows(&self, module: &str, case_id: &str) -> Result<Vec<TaskRecord>> {
        self.ensure_module_table(module)?;
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            r#"SELECT {} FROM "{}" WHERE case_id = ?1 ORDER BY id"#,
            TASK_COLUMNS, module
        ))?;
        let rows = stmt.query_map([case_id], TaskRecord::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
