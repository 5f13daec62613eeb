use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDateTime;
use newsroom_core::config::SchedulerConfig;
use rusqlite::Connection;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    db::init_db,
    error::{Result, SchedulerError},
    ledger::{ExecutionLedger, RECOVERY_MARKER},
    progress::ProgressTracker,
    queue::{EnqueueResult, ExecutionQueue},
    runner::ExecutionRunner,
    schedule::{compute_next, due_state, DueState},
    store::JobStore,
    types::{
        ExecutionCounts, ExecutionOutcome, ExecutionRecord, Job, NewJob, Origin, RunningExecution,
        SchedulerStatus,
    },
};

/// Shared handle for job management and status queries while the engine runs.
///
/// Cheap to clone. Lock order is queue before database whenever both are held.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: JobStore,
    ledger: ExecutionLedger,
    queue: Arc<Mutex<ExecutionQueue>>,
    progress: ProgressTracker,
    clock: Arc<dyn Clock>,
    wake: Arc<Notify>,
}

impl SchedulerHandle {
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self::with_shared(Arc::new(Mutex::new(conn)), clock))
    }

    /// Build over a connection whose schema is already initialised.
    pub fn with_shared(db: Arc<Mutex<Connection>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: JobStore::new(db.clone()),
            ledger: ExecutionLedger::new(db),
            queue: Arc::new(Mutex::new(ExecutionQueue::new())),
            progress: ProgressTracker::new(),
            clock,
            wake: Arc::new(Notify::new()),
        }
    }

    fn queue(&self) -> Result<MutexGuard<'_, ExecutionQueue>> {
        self.queue
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned("execution queue"))
    }

    /// Validate and persist a new job. Enabled jobs get `next_run_at` right away.
    pub fn create_job(&self, new: NewJob) -> Result<Job> {
        let trigger_time = new.validate()?;
        let now = self.clock.now();
        let next_run_at = if new.enabled {
            compute_next(trigger_time, new.recurrence, None, now)
        } else {
            None
        };
        let job = Job {
            id: Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            trigger_time,
            source_ref: new.source_ref.trim().to_string(),
            volume: new.volume,
            model_refs: new.model_refs,
            recurrence: new.recurrence,
            enabled: new.enabled,
            run_count: 0,
            success_count: 0,
            last_run_at: None,
            next_run_at,
            last_error: None,
            last_output_ref: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&job)?;
        info!(job_id = %job.id, name = %job.name, next_run_at = ?job.next_run_at, "job created");
        Ok(job)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.store.list()
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.store
            .get(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    /// Delete a job, its queued entry and its history. Refused while it runs.
    pub fn delete_job(&self, id: &str) -> Result<()> {
        let mut queue = self.queue()?;
        if queue.is_active(id) {
            return Err(SchedulerError::JobRunning { id: id.to_string() });
        }
        self.store.delete(id)?;
        queue.remove(id);
        info!(job_id = %id, "job removed");
        Ok(())
    }

    /// Enable (recomputing `next_run_at` from now) or disable (clearing it).
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<Job> {
        let job = self.store.set_enabled(id, enabled, self.clock.now())?;
        info!(job_id = %id, enabled, next_run_at = ?job.next_run_at, "job toggled");
        Ok(job)
    }

    /// Queue an on-demand run ahead of scheduled work, ignoring `enabled`.
    pub fn run_now(&self, id: &str) -> Result<EnqueueResult> {
        self.get_job(id)?;
        let result = self.queue()?.enqueue_manual(id, self.clock.now());
        if matches!(result, EnqueueResult::Enqueued | EnqueueResult::Promoted) {
            self.wake.notify_one();
        }
        info!(job_id = %id, ?result, "manual run requested");
        Ok(result)
    }

    /// Running slot, queue contents and aggregate counts.
    pub fn status(&self) -> Result<SchedulerStatus> {
        let (active, queue) = {
            let q = self.queue()?;
            (q.active().cloned(), q.entries())
        };
        let (total, completed, failed) = self.ledger.counts()?;
        let pending = queue.len() as u64 + u64::from(active.is_some());

        let running = active.map(|a| RunningExecution {
            job_name: self.store.get(&a.job_id).ok().flatten().map(|j| j.name),
            job_id: a.job_id,
            execution_id: a.execution_id,
            origin: a.origin,
            started_at: a.started_at,
            progress: self.progress.snapshot(),
        });

        Ok(SchedulerStatus {
            running,
            queue,
            counts: ExecutionCounts {
                total,
                completed,
                failed,
                pending,
            },
        })
    }

    /// A job's execution history, newest first.
    pub fn executions(&self, id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.get_job(id)?;
        self.ledger.for_job(id, limit)
    }
}

/// What one [`SchedulerEngine::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Unfinished executions reconciled at startup.
    pub recovered: usize,
    pub enqueued: usize,
    pub executed: usize,
    /// Scheduled entries discarded because their job was disabled or deleted.
    pub dropped: usize,
}

/// A finished execution whose outcome is not durable yet.
#[derive(Debug)]
struct Settlement {
    job_id: String,
    execution_id: i64,
    outcome: ExecutionOutcome,
    completed_at: NaiveDateTime,
    next_run_at: Option<NaiveDateTime>,
    ledger_written: bool,
}

enum Step {
    Idle,
    Executed,
    Dropped,
}

/// The scheduler loop: scans due jobs, drives one execution at a time and
/// writes the outcome back.
pub struct SchedulerEngine {
    handle: SchedulerHandle,
    runner: ExecutionRunner,
    poll_interval: Duration,
    recovered: bool,
    unsettled: Option<Settlement>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl SchedulerEngine {
    pub fn new(handle: &SchedulerHandle, runner: ExecutionRunner, cfg: &SchedulerConfig) -> Self {
        Self {
            handle: handle.clone(),
            runner,
            poll_interval: cfg.poll_interval(),
            recovered: false,
            unsettled: None,
            shutdown: None,
        }
    }

    /// Main loop. Ticks every poll interval or when a manual run is queued,
    /// until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_secs = self.poll_interval.as_secs(), "scheduler engine started");
        self.shutdown = Some(shutdown.clone());
        let wake = self.handle.wake.clone();

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if self.stopping() {
                break;
            }
            match self.tick().await {
                Ok(report) if report != TickReport::default() => debug!(?report, "tick"),
                Ok(_) => {}
                Err(e) => error!(error = %e, code = e.code(), "scheduler tick failed"),
            }
        }
        info!("scheduler engine shutting down");
    }

    /// One wake-up: recover (first time only), retry an unsettled outcome,
    /// scan for due jobs, then drain the queue one execution at a time.
    ///
    /// A storage error aborts the tick; the next tick picks up where it stopped.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();

        if !self.recovered {
            report.recovered = self.recover()?;
            self.recovered = true;
        }
        if let Some(settlement) = self.unsettled.take() {
            self.settle(settlement)?;
        }

        report.enqueued = self.scan()?;

        while !self.stopping() {
            match self.execute_next().await? {
                Step::Idle => break,
                Step::Executed => report.executed += 1,
                Step::Dropped => report.dropped += 1,
            }
        }
        Ok(report)
    }

    fn stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fail every execution left unfinished by a previous process.
    ///
    /// Job rows are brought forward before the ledger rows are closed, so a
    /// failure part way leaves the executions unfinished for the next tick.
    fn recover(&self) -> Result<usize> {
        let h = &self.handle;
        let now = h.clock.now();

        for record in h.ledger.unfinished()? {
            warn!(
                execution_id = record.id,
                job_id = %record.job_id,
                started_at = %record.started_at,
                "reconciling interrupted execution"
            );
            if !h.store.apply_recovery(&record.job_id, RECOVERY_MARKER, now)? {
                debug!(job_id = %record.job_id, "interrupted execution has no job");
            }
        }
        let reconciled = h.ledger.reconcile_unfinished(RECOVERY_MARKER, now)?;
        Ok(reconciled.len())
    }

    /// Enqueue due jobs in ascending `next_run_at` order and schedule the
    /// never-evaluated ones.
    fn scan(&self) -> Result<usize> {
        let h = &self.handle;
        let now = h.clock.now();

        let mut due = Vec::new();
        for job in h.store.list_enabled()? {
            match due_state(&job, now) {
                DueState::Due => due.push(job),
                DueState::Unscheduled => {
                    let next = compute_next(job.trigger_time, job.recurrence, job.last_run_at, now);
                    h.store.set_next_run(&job.id, next, now)?;
                }
                DueState::Idle => {}
            }
        }
        due.sort_by_key(|job| job.next_run_at);

        let mut queue = h.queue()?;
        let mut enqueued = 0;
        for job in &due {
            if queue.enqueue_scheduled(&job.id, now) == EnqueueResult::Enqueued {
                debug!(job_id = %job.id, next_run_at = ?job.next_run_at, "job due");
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Dequeue the front entry and run it to completion.
    async fn execute_next(&mut self) -> Result<Step> {
        let h = self.handle.clone();
        let now = h.clock.now();
        let Some(entry) = h.queue()?.dequeue(now) else {
            return Ok(Step::Idle);
        };

        let job = match h.store.get(&entry.job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %entry.job_id, "queued job no longer exists");
                h.queue()?.finish();
                return Ok(Step::Dropped);
            }
            Err(e) => {
                h.queue()?.restore(entry);
                return Err(e);
            }
        };
        if entry.origin == Origin::Scheduled && !job.enabled {
            info!(job_id = %job.id, "dropping scheduled entry of disabled job");
            h.queue()?.finish();
            return Ok(Step::Dropped);
        }

        let execution_id = match h.ledger.start(&job.id, now) {
            Ok(id) => id,
            Err(e) => {
                h.queue()?.restore(entry);
                return Err(e);
            }
        };
        h.queue()?.mark_started(execution_id);
        info!(job_id = %job.id, execution_id, origin = %entry.origin, "execution started");

        let outcome = self.runner.run(&job, &h.progress).await;

        let completed_at = h.clock.now();
        let next_run_at = compute_next(
            job.trigger_time,
            job.recurrence,
            Some(completed_at),
            completed_at,
        );
        self.settle(Settlement {
            job_id: job.id,
            execution_id,
            outcome,
            completed_at,
            next_run_at,
            ledger_written: false,
        })?;
        Ok(Step::Executed)
    }

    /// Persist an outcome and free the running slot. On failure the outcome
    /// is kept and the slot stays occupied until a later tick succeeds.
    fn settle(&mut self, mut settlement: Settlement) -> Result<()> {
        match self.write_settlement(&mut settlement) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    job_id = %settlement.job_id,
                    execution_id = settlement.execution_id,
                    error = %e,
                    "could not record execution outcome, will retry"
                );
                self.unsettled = Some(settlement);
                Err(e)
            }
        }
    }

    fn write_settlement(&self, s: &mut Settlement) -> Result<()> {
        let h = &self.handle;
        if !s.ledger_written {
            if !h.ledger.complete(s.execution_id, &s.outcome, s.completed_at)? {
                warn!(
                    job_id = %s.job_id,
                    execution_id = s.execution_id,
                    "execution record vanished before its outcome was written"
                );
            }
            s.ledger_written = true;
        }
        if !h.store.record_run(&s.job_id, &s.outcome, s.completed_at, s.next_run_at)? {
            warn!(job_id = %s.job_id, "job vanished before its outcome was recorded");
        }
        h.queue()?.finish();
        h.progress.clear();

        if s.outcome.is_success() {
            info!(
                job_id = %s.job_id,
                execution_id = s.execution_id,
                items = s.outcome.item_count,
                "execution completed"
            );
        } else {
            warn!(
                job_id = %s.job_id,
                execution_id = s.execution_id,
                error = s.outcome.error.as_deref().unwrap_or_default(),
                "execution failed"
            );
        }
        Ok(())
    }
}
