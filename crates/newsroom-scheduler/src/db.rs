use chrono::NaiveDateTime;
use rusqlite::{types::Type, Connection};

use crate::error::Result;

/// Persisted timestamp layout. Lexical order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `executions` tables (idempotent). The partial
/// unique index on `executions(status)` lets at most one row be `running`
/// at any time, backing up the in-memory single-slot gate.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            name            TEXT    NOT NULL,
            trigger_time    TEXT    NOT NULL,   -- HH:MM local
            source_ref      TEXT    NOT NULL,
            volume          INTEGER NOT NULL,
            model_refs      TEXT    NOT NULL,   -- JSON array of strings
            recurrence      TEXT    NOT NULL,
            enabled         INTEGER NOT NULL DEFAULT 1,
            run_count       INTEGER NOT NULL DEFAULT 0,
            success_count   INTEGER NOT NULL DEFAULT 0,
            last_run_at     TEXT,
            next_run_at     TEXT,
            last_error      TEXT,
            last_output_ref TEXT,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON jobs (next_run_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_enabled ON jobs (enabled);

        CREATE TABLE IF NOT EXISTS executions (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id        TEXT    NOT NULL,
            started_at    TEXT    NOT NULL,
            completed_at  TEXT,
            status        TEXT    NOT NULL,
            error_message TEXT,
            output_refs   TEXT,                 -- JSON array or NULL
            item_count    INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_job
            ON executions (job_id, started_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_single_running
            ON executions (status) WHERE status = 'running';
        ",
    )?;
    Ok(())
}

pub(crate) fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn format_opt_ts(ts: Option<NaiveDateTime>) -> Option<String> {
    ts.map(format_ts)
}

/// Parse a stored timestamp column, reporting the column index on failure.
pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<NaiveDateTime>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

/// Parse a text column through `FromStr`, mapping the error into rusqlite's.
pub(crate) fn parse_text<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

/// Decode a JSON text column.
pub(crate) fn parse_json<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
