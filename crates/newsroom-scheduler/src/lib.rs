//! `newsroom-scheduler` — single-slot job scheduler and execution queue with
//! SQLite persistence.
//!
//! # Overview
//!
//! Jobs live in a SQLite `jobs` table and every attempt is appended to the
//! `executions` ledger. The [`engine::SchedulerEngine`] wakes on a fixed poll
//! interval (or when a manual run is queued), enqueues due jobs, and drives at
//! most one execution at a time through the [`runner::ExecutionRunner`].
//! Callers manage jobs through the cloneable [`engine::SchedulerHandle`].
//!
//! # Recurrence
//!
//! | Rule       | Fires                                          |
//! |------------|------------------------------------------------|
//! | `once`     | Next `HH:MM` after creation, then disabled     |
//! | `daily`    | Every day at `HH:MM` local time                |
//! | `weekdays` | Monday to Friday at `HH:MM`                    |
//! | `weekends` | Saturday and Sunday at `HH:MM`                 |

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod limiter;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{SchedulerEngine, SchedulerHandle, TickReport};
pub use error::{Result, SchedulerError};
pub use ledger::RECOVERY_MARKER;
pub use limiter::RateLimiter;
pub use pipeline::{ContentPipeline, ModelError, PipelineError, SourceError};
pub use progress::ProgressTracker;
pub use queue::EnqueueResult;
pub use runner::ExecutionRunner;
pub use types::{
    ExecutionCounts, ExecutionOutcome, ExecutionProgress, ExecutionRecord, ExecutionStage,
    ExecutionStatus, Job, NewJob, Origin, QueueEntry, Recurrence, SchedulerStatus, TriggerTime,
};
