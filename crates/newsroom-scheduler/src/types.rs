use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Upper bound for `Job::volume` (items fetched per source unit).
pub const MAX_VOLUME: u8 = 5;

/// Time of day a job fires at, in the scheduler's local clock. Minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TriggerTime(NaiveTime);

impl TriggerTime {
    /// Build from hour and minute; `None` when either is out of range.
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl fmt::Display for TriggerTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

impl FromStr for TriggerTime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map(Self)
            .map_err(|_| format!("invalid trigger time '{s}', expected HH:MM"))
    }
}

impl TryFrom<String> for TriggerTime {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TriggerTime> for String {
    fn from(t: TriggerTime) -> Self {
        t.to_string()
    }
}

/// Calendar-repetition policy of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    /// Fire a single time, then the job is exhausted.
    #[default]
    Once,
    Daily,
    /// Monday through Friday.
    Weekdays,
    /// Saturday and Sunday.
    Weekends,
}

impl Recurrence {
    /// Whether a trigger may land on `day`.
    pub fn allows(self, day: Weekday) -> bool {
        let weekend = matches!(day, Weekday::Sat | Weekday::Sun);
        match self {
            Recurrence::Once | Recurrence::Daily => true,
            Recurrence::Weekdays => !weekend,
            Recurrence::Weekends => weekend,
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Recurrence::Once => "once",
            Recurrence::Daily => "daily",
            Recurrence::Weekdays => "weekdays",
            Recurrence::Weekends => "weekends",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Recurrence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "once" => Ok(Recurrence::Once),
            "daily" => Ok(Recurrence::Daily),
            "weekdays" => Ok(Recurrence::Weekdays),
            "weekends" => Ok(Recurrence::Weekends),
            other => Err(format!("unknown recurrence: {other}")),
        }
    }
}

/// A persisted job definition plus its run bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUID v4 string — primary key.
    pub id: String,
    pub name: String,
    pub trigger_time: TriggerTime,
    /// Opaque handle of the content-source collection (resolved by the pipeline).
    pub source_ref: String,
    /// Items fetched per source unit, `1..=MAX_VOLUME`.
    pub volume: u8,
    /// Model identifiers: `[0]` summarizes items, `[1]` (or `[0]`) composes.
    pub model_refs: Vec<String>,
    pub recurrence: Recurrence,
    pub enabled: bool,
    pub run_count: u32,
    pub success_count: u32,
    pub last_run_at: Option<NaiveDateTime>,
    pub next_run_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub last_output_ref: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Job {
    /// Model used for the per-item stage.
    pub fn summary_model(&self) -> &str {
        self.model_refs.first().map(String::as_str).unwrap_or_default()
    }

    /// Model used for the composition stage; falls back to the summary model.
    pub fn compose_model(&self) -> &str {
        self.model_refs
            .get(1)
            .map(String::as_str)
            .unwrap_or_else(|| self.summary_model())
    }

    /// A `once` job that has already run can never fire again.
    pub fn is_exhausted(&self) -> bool {
        self.recurrence == Recurrence::Once && self.last_run_at.is_some()
    }
}

/// Request body for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    /// `HH:MM`, validated by [`NewJob::validate`].
    pub trigger_time: String,
    pub source_ref: String,
    #[serde(default = "default_volume")]
    pub volume: u8,
    pub model_refs: Vec<String>,
    #[serde(default)]
    pub recurrence: Recurrence,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_volume() -> u8 {
    1
}

fn default_enabled() -> bool {
    true
}

impl NewJob {
    /// Check every field and return the parsed trigger time.
    pub fn validate(&self) -> Result<TriggerTime> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::Validation("name must not be empty".into()));
        }
        if self.source_ref.trim().is_empty() {
            return Err(SchedulerError::Validation(
                "source_ref must not be empty".into(),
            ));
        }
        if !(1..=MAX_VOLUME).contains(&self.volume) {
            return Err(SchedulerError::Validation(format!(
                "volume must be between 1 and {MAX_VOLUME}, got {}",
                self.volume
            )));
        }
        if self.model_refs.is_empty() {
            return Err(SchedulerError::Validation(
                "at least one model reference is required".into(),
            ));
        }
        if self.model_refs.iter().any(|m| m.trim().is_empty()) {
            return Err(SchedulerError::Validation(
                "model references must not be empty".into(),
            ));
        }
        self.trigger_time
            .parse()
            .map_err(SchedulerError::Validation)
    }
}

/// Lifecycle state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ExecutionStatus::Queued),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One row of the execution ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub job_id: String,
    pub started_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub output_refs: Option<Vec<String>>,
    pub item_count: u32,
}

/// Terminal result reported by the execution runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Always `Completed` or `Failed`.
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub outputs: Vec<String>,
    pub item_count: u32,
}

impl ExecutionOutcome {
    pub fn completed(outputs: Vec<String>, item_count: u32) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            error: None,
            outputs,
            item_count,
        }
    }

    pub fn failed(error: impl Into<String>, item_count: u32) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(error.into()),
            outputs: Vec::new(),
            item_count,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Who asked for a queued execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Enqueued by the periodic due scan.
    Scheduled,
    /// Enqueued on demand; runs ahead of scheduled entries and ignores `enabled`.
    Manual,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Scheduled => write!(f, "scheduled"),
            Origin::Manual => write!(f, "manual"),
        }
    }
}

/// A pending request to execute a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub origin: Origin,
    pub enqueued_at: NaiveDateTime,
}

/// Aggregate ledger/queue counts for status views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    /// Queued entries plus the running slot.
    pub pending: u64,
}

/// Pipeline phase of the running execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Resolving,
    Fetching,
    Summarizing,
    Composing,
    Publishing,
}

/// Where the running execution is. `done` of `total` counts source units
/// while fetching and items while summarizing; both are 0 otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub stage: ExecutionStage,
    pub done: u32,
    pub total: u32,
}

/// The execution currently occupying the single running slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningExecution {
    pub job_id: String,
    pub job_name: Option<String>,
    /// `None` between dequeue and the ledger row being written.
    pub execution_id: Option<i64>,
    pub origin: Origin,
    pub started_at: NaiveDateTime,
    /// `None` until the pipeline has started.
    pub progress: Option<ExecutionProgress>,
}

/// Point-in-time view of the scheduler for status polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: Option<RunningExecution>,
    pub queue: Vec<QueueEntry>,
    pub counts: ExecutionCounts,
}
