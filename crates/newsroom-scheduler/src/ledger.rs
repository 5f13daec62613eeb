use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use tracing::instrument;

use crate::db::{format_ts, parse_json, parse_opt_ts, parse_text, parse_ts};
use crate::error::{Result, SchedulerError};
use crate::types::{ExecutionOutcome, ExecutionRecord, ExecutionStatus};

/// Error message written to executions found unfinished at startup.
pub const RECOVERY_MARKER: &str = "interrupted: process stopped before the execution finished";

const EXECUTION_COLUMNS: &str =
    "id, job_id, started_at, completed_at, status, error_message, output_refs, item_count";

/// Append-only history of execution attempts.
///
/// Rows are inserted as `running` when an entry leaves the queue and are
/// updated exactly once to a terminal status.
#[derive(Clone)]
pub struct ExecutionLedger {
    db: Arc<Mutex<Connection>>,
}

impl ExecutionLedger {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned("execution ledger"))
    }

    /// Open a `running` record for `job_id` and return its id.
    #[instrument(skip(self))]
    pub fn start(&self, job_id: &str, started_at: NaiveDateTime) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO executions (job_id, started_at, status) VALUES (?1, ?2, 'running')",
            params![job_id, format_ts(started_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Write the terminal fields of an execution. Returns `false` when the
    /// record no longer exists.
    #[instrument(skip(self, outcome), fields(status = %outcome.status))]
    pub fn complete(
        &self,
        id: i64,
        outcome: &ExecutionOutcome,
        completed_at: NaiveDateTime,
    ) -> Result<bool> {
        let outputs = if outcome.outputs.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&outcome.outputs)?)
        };
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE executions
             SET completed_at = ?1, status = ?2, error_message = ?3,
                 output_refs = ?4, item_count = ?5
             WHERE id = ?6",
            params![
                format_ts(completed_at),
                outcome.status.to_string(),
                outcome.error,
                outputs,
                outcome.item_count,
                id,
            ],
        )?;
        Ok(n > 0)
    }

    /// A job's history, newest first.
    pub fn for_job(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE job_id = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![job_id, limit as i64], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Records that are not terminal yet.
    pub fn unfinished(&self) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE status IN ('queued', 'running')
             ORDER BY started_at, id"
        ))?;
        let rows = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Fail every non-terminal record with `marker` as its error.
    ///
    /// Only valid before any execution has started in this process. Returns
    /// the records as they were before reconciliation.
    #[instrument(skip(self))]
    pub fn reconcile_unfinished(
        &self,
        marker: &str,
        now: NaiveDateTime,
    ) -> Result<Vec<ExecutionRecord>> {
        let stuck = self.unfinished()?;
        if stuck.is_empty() {
            return Ok(stuck);
        }
        let conn = self.conn()?;
        conn.execute(
            "UPDATE executions
             SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE status IN ('queued', 'running')",
            params![marker, format_ts(now)],
        )?;
        Ok(stuck)
    }

    /// Total, completed and failed record counts.
    pub fn counts(&self) -> Result<(u64, u64, u64)> {
        let conn = self.conn()?;
        let counts = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'completed'), 0),
                    COALESCE(SUM(status = 'failed'), 0)
             FROM executions",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )?;
        Ok(counts)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let output_refs: Option<String> = row.get(6)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        started_at: parse_ts(2, &row.get::<_, String>(2)?)?,
        completed_at: parse_opt_ts(3, row.get(3)?)?,
        status: parse_text::<ExecutionStatus>(4, &row.get::<_, String>(4)?)?,
        error_message: row.get(5)?,
        output_refs: output_refs.map(|raw| parse_json(6, &raw)).transpose()?,
        item_count: row.get(7)?,
    })
}
