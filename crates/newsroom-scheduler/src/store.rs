use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::db::{format_opt_ts, format_ts, parse_json, parse_opt_ts, parse_text, parse_ts};
use crate::error::{Result, SchedulerError};
use crate::schedule::compute_next;
use crate::types::{ExecutionOutcome, Job, Recurrence};

const JOB_COLUMNS: &str = "id, name, trigger_time, source_ref, volume, model_refs, recurrence,
     enabled, run_count, success_count, last_run_at, next_run_at, last_error,
     last_output_ref, created_at, updated_at";

/// Durable job definitions and their run counters.
///
/// Shares its connection with [`crate::ledger::ExecutionLedger`]; each call
/// holds the lock for one statement or transaction, so readers always see
/// whole rows.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned("job store"))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn insert(&self, job: &Job) -> Result<()> {
        let model_refs = serde_json::to_string(&job.model_refs)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)"
            ),
            params![
                job.id,
                job.name,
                job.trigger_time.to_string(),
                job.source_ref,
                job.volume,
                model_refs,
                job.recurrence.to_string(),
                job.enabled,
                job.run_count,
                job.success_count,
                format_opt_ts(job.last_run_at),
                format_opt_ts(job.next_run_at),
                job.last_error,
                job.last_output_ref,
                format_ts(job.created_at),
                format_ts(job.updated_at),
            ],
        )?;
        info!(name = %job.name, recurrence = %job.recurrence, "job stored");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn()?;
        select_job(&conn, id)
    }

    /// All jobs, soonest trigger first; unscheduled jobs last.
    pub fn list(&self) -> Result<Vec<Job>> {
        self.query_jobs(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             ORDER BY next_run_at IS NULL, next_run_at, created_at"
        ))
    }

    /// Jobs the due scan has to look at.
    pub fn list_enabled(&self) -> Result<Vec<Job>> {
        self.query_jobs(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE enabled = 1
             ORDER BY next_run_at IS NULL, next_run_at, created_at"
        ))
    }

    fn query_jobs(&self, sql: &str) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Flip `enabled` and store the matching `next_run_at`, computed from
    /// the row as it is inside the same transaction.
    ///
    /// Enabling an exhausted `once` job leaves it unscheduled.
    #[instrument(skip(self))]
    pub fn set_enabled(&self, id: &str, enabled: bool, now: NaiveDateTime) -> Result<Job> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let job = select_job(&tx, id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        let next_run_at = if enabled {
            compute_next(job.trigger_time, job.recurrence, job.last_run_at, now)
        } else {
            None
        };
        tx.execute(
            "UPDATE jobs SET enabled = ?1, next_run_at = ?2, updated_at = ?3 WHERE id = ?4",
            params![enabled, format_opt_ts(next_run_at), format_ts(now), id],
        )?;
        tx.commit()?;
        Ok(Job {
            enabled,
            next_run_at,
            updated_at: now,
            ..job
        })
    }

    /// Schedule a job that has no `next_run_at` yet. A job disabled or
    /// scheduled in the meantime is left alone; returns whether a row changed.
    pub fn set_next_run(
        &self,
        id: &str,
        next_run_at: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET next_run_at = ?1, updated_at = ?2
             WHERE id = ?3 AND enabled = 1 AND next_run_at IS NULL",
            params![format_opt_ts(next_run_at), format_ts(now), id],
        )?;
        debug!(job_id = %id, next_run_at = ?next_run_at, applied = n > 0, "next run recomputed");
        Ok(n > 0)
    }

    /// Apply a finished execution to the job row in one statement.
    ///
    /// Counters are incremented in SQL. `once` jobs are disabled. A job that
    /// was disabled while running keeps `next_run_at` null. Returns `false`
    /// when the job no longer exists.
    #[instrument(skip(self, outcome), fields(success = outcome.is_success()))]
    pub fn record_run(
        &self,
        id: &str,
        outcome: &ExecutionOutcome,
        completed_at: NaiveDateTime,
        next_run_at: Option<NaiveDateTime>,
    ) -> Result<bool> {
        let output_ref = if outcome.is_success() {
            outcome.outputs.first().cloned()
        } else {
            None
        };
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET
                run_count       = run_count + 1,
                success_count   = success_count + ?1,
                last_run_at     = ?2,
                last_error      = ?3,
                last_output_ref = ?4,
                enabled         = CASE WHEN recurrence = 'once' THEN 0 ELSE enabled END,
                next_run_at     = CASE WHEN recurrence = 'once' OR enabled = 0
                                       THEN NULL ELSE ?5 END,
                updated_at      = ?2
             WHERE id = ?6",
            params![
                u32::from(outcome.is_success()),
                format_ts(completed_at),
                outcome.error,
                output_ref,
                format_opt_ts(next_run_at),
                id,
            ],
        )?;
        Ok(n > 0)
    }

    /// Bring a job forward after an interrupted execution.
    ///
    /// `once` jobs are disabled, enabled recurring jobs are rescheduled from
    /// `now`. `last_error` is only filled when the job has no other error
    /// recorded. Safe to repeat. Returns `false` when the job is gone.
    #[instrument(skip(self))]
    pub fn apply_recovery(&self, id: &str, marker: &str, now: NaiveDateTime) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(job) = select_job(&tx, id)? else {
            return Ok(false);
        };
        let (enabled, next_run_at) = match job.recurrence {
            Recurrence::Once => (false, None),
            _ if job.enabled => (
                true,
                compute_next(job.trigger_time, job.recurrence, job.last_run_at, now),
            ),
            _ => (false, None),
        };
        tx.execute(
            "UPDATE jobs SET last_error  = COALESCE(last_error, ?1),
                             enabled     = ?2,
                             next_run_at = ?3,
                             updated_at  = ?4
             WHERE id = ?5",
            params![marker, enabled, format_opt_ts(next_run_at), format_ts(now), id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Delete a job and its whole execution history in one transaction.
    ///
    /// Returns the number of execution records removed.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let executions = tx.execute("DELETE FROM executions WHERE job_id = ?1", [id])?;
        let jobs = tx.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if jobs == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        tx.commit()?;
        info!(executions, "job deleted");
        Ok(executions)
    }
}

fn select_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

/// Map a SQLite row (selected with `JOB_COLUMNS`) to a `Job`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        trigger_time: parse_text(2, &row.get::<_, String>(2)?)?,
        source_ref: row.get(3)?,
        volume: row.get(4)?,
        model_refs: parse_json(5, &row.get::<_, String>(5)?)?,
        recurrence: parse_text(6, &row.get::<_, String>(6)?)?,
        enabled: row.get(7)?,
        run_count: row.get(8)?,
        success_count: row.get(9)?,
        last_run_at: parse_opt_ts(10, row.get(10)?)?,
        next_run_at: parse_opt_ts(11, row.get(11)?)?,
        last_error: row.get(12)?,
        last_output_ref: row.get(13)?,
        created_at: parse_ts(14, &row.get::<_, String>(14)?)?,
        updated_at: parse_ts(15, &row.get::<_, String>(15)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::types::TriggerTime;
    use chrono::NaiveDate;

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn store() -> JobStore {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        JobStore::new(Arc::new(Mutex::new(conn)))
    }

    fn job(id: &str, recurrence: Recurrence, next: Option<NaiveDateTime>) -> Job {
        Job {
            id: id.into(),
            name: format!("job {id}"),
            trigger_time: TriggerTime::new(6, 30).unwrap(),
            source_ref: "tech".into(),
            volume: 3,
            model_refs: vec!["summarizer".into(), "anchor".into()],
            recurrence,
            enabled: true,
            run_count: 0,
            success_count: 0,
            last_run_at: None,
            next_run_at: next,
            last_error: None,
            last_output_ref: None,
            created_at: at(1, 0, 0),
            updated_at: at(1, 0, 0),
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let store = store();
        store
            .insert(&job("a", Recurrence::Weekdays, Some(at(5, 6, 30))))
            .unwrap();
        let loaded = store.get("a").unwrap().unwrap();
        assert_eq!(loaded.recurrence, Recurrence::Weekdays);
        assert_eq!(loaded.model_refs, vec!["summarizer", "anchor"]);
        assert_eq!(loaded.next_run_at, Some(at(5, 6, 30)));
        assert_eq!(loaded.volume, 3);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn list_orders_by_next_run_with_unscheduled_last() {
        let store = store();
        store.insert(&job("late", Recurrence::Daily, Some(at(6, 6, 30)))).unwrap();
        store.insert(&job("none", Recurrence::Daily, None)).unwrap();
        store.insert(&job("early", Recurrence::Daily, Some(at(5, 6, 30)))).unwrap();

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["early", "late", "none"]);
    }

    #[test]
    fn list_enabled_skips_disabled_jobs() {
        let store = store();
        store.insert(&job("on", Recurrence::Daily, None)).unwrap();
        store.insert(&job("off", Recurrence::Daily, None)).unwrap();
        store.set_enabled("off", false, at(5, 0, 0)).unwrap();

        let ids: Vec<_> = store.list_enabled().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["on"]);
    }

    #[test]
    fn record_run_counts_and_reschedules() {
        let store = store();
        store.insert(&job("a", Recurrence::Daily, Some(at(5, 6, 30)))).unwrap();

        let ok = ExecutionOutcome::completed(vec!["digest.md".into(), "digest.mp3".into()], 4);
        assert!(store.record_run("a", &ok, at(5, 6, 31), Some(at(6, 6, 30))).unwrap());
        let failed = ExecutionOutcome::failed("compose failed", 2);
        assert!(store.record_run("a", &failed, at(6, 6, 33), Some(at(7, 6, 30))).unwrap());

        let j = store.get("a").unwrap().unwrap();
        assert_eq!(j.run_count, 2);
        assert_eq!(j.success_count, 1);
        assert_eq!(j.last_error.as_deref(), Some("compose failed"));
        assert_eq!(j.last_output_ref, None);
        assert_eq!(j.last_run_at, Some(at(6, 6, 33)));
        assert_eq!(j.next_run_at, Some(at(7, 6, 30)));
        assert!(j.enabled);
    }

    #[test]
    fn record_run_disables_once_jobs() {
        let store = store();
        store.insert(&job("a", Recurrence::Once, Some(at(5, 6, 30)))).unwrap();
        let ok = ExecutionOutcome::completed(vec!["digest.md".into()], 1);
        store.record_run("a", &ok, at(5, 6, 31), None).unwrap();

        let j = store.get("a").unwrap().unwrap();
        assert!(!j.enabled);
        assert_eq!(j.next_run_at, None);
        assert_eq!(j.last_output_ref.as_deref(), Some("digest.md"));
    }

    #[test]
    fn record_run_keeps_disabled_job_unscheduled() {
        let store = store();
        store.insert(&job("a", Recurrence::Daily, None)).unwrap();
        store.set_enabled("a", false, at(5, 0, 0)).unwrap();
        let ok = ExecutionOutcome::completed(vec![], 1);
        store.record_run("a", &ok, at(5, 6, 31), Some(at(6, 6, 30))).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().next_run_at, None);
    }

    #[test]
    fn record_run_on_missing_job_reports_false() {
        let store = store();
        let ok = ExecutionOutcome::completed(vec![], 1);
        assert!(!store.record_run("ghost", &ok, at(5, 6, 31), None).unwrap());
    }

    #[test]
    fn recovery_keeps_existing_error() {
        let store = store();
        let mut j = job("a", Recurrence::Daily, Some(at(5, 6, 30)));
        j.last_error = Some("feed timeout".into());
        store.insert(&j).unwrap();
        store.insert(&job("b", Recurrence::Daily, Some(at(5, 6, 30)))).unwrap();

        assert!(store.apply_recovery("a", "interrupted", at(5, 8, 0)).unwrap());
        assert!(store.apply_recovery("b", "interrupted", at(5, 8, 0)).unwrap());
        assert!(!store.apply_recovery("ghost", "interrupted", at(5, 8, 0)).unwrap());

        let a = store.get("a").unwrap().unwrap();
        assert_eq!(a.last_error.as_deref(), Some("feed timeout"));
        assert_eq!(a.next_run_at, Some(at(6, 6, 30)));
        assert_eq!(store.get("b").unwrap().unwrap().last_error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn recovery_disables_once_jobs_and_can_repeat() {
        let store = store();
        store.insert(&job("a", Recurrence::Once, Some(at(5, 6, 30)))).unwrap();
        for _ in 0..2 {
            store.apply_recovery("a", "interrupted", at(5, 8, 0)).unwrap();
            let j = store.get("a").unwrap().unwrap();
            assert!(!j.enabled);
            assert_eq!(j.next_run_at, None);
            assert_eq!(j.run_count, 0);
        }
    }

    #[test]
    fn enabling_reads_the_latest_run() {
        let store = store();
        store.insert(&job("a", Recurrence::Once, Some(at(5, 6, 30)))).unwrap();
        store.set_enabled("a", false, at(5, 6, 0)).unwrap();
        let ok = ExecutionOutcome::completed(vec![], 1);
        store.record_run("a", &ok, at(5, 6, 31), None).unwrap();

        let j = store.set_enabled("a", true, at(5, 7, 0)).unwrap();
        assert!(j.enabled);
        assert_eq!(j.next_run_at, None);
        assert_eq!(store.get("a").unwrap().unwrap().next_run_at, None);

        store.insert(&job("b", Recurrence::Daily, None)).unwrap();
        let j = store.set_enabled("b", true, at(5, 7, 0)).unwrap();
        assert_eq!(j.next_run_at, Some(at(6, 6, 30)));
        assert!(matches!(
            store.set_enabled("ghost", true, at(5, 7, 0)),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[test]
    fn next_run_is_not_written_onto_disabled_or_scheduled_jobs() {
        let store = store();
        store.insert(&job("off", Recurrence::Daily, None)).unwrap();
        store.set_enabled("off", false, at(5, 0, 0)).unwrap();
        assert!(!store.set_next_run("off", Some(at(5, 6, 30)), at(5, 0, 0)).unwrap());
        assert_eq!(store.get("off").unwrap().unwrap().next_run_at, None);

        store.insert(&job("set", Recurrence::Daily, Some(at(6, 6, 30)))).unwrap();
        assert!(!store.set_next_run("set", Some(at(5, 6, 30)), at(5, 0, 0)).unwrap());

        store.insert(&job("new", Recurrence::Daily, None)).unwrap();
        assert!(store.set_next_run("new", Some(at(5, 6, 30)), at(5, 0, 0)).unwrap());
        assert_eq!(store.get("new").unwrap().unwrap().next_run_at, Some(at(5, 6, 30)));
    }

    #[test]
    fn delete_missing_job_is_not_found() {
        let store = store();
        assert!(matches!(
            store.delete("ghost"),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }
}
