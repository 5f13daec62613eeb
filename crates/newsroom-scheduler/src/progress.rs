use std::sync::{Arc, Mutex};

use crate::types::{ExecutionProgress, ExecutionStage};

/// Shared view of the running execution's pipeline phase.
///
/// The runner writes it, status queries read it. Cheap to clone.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<Mutex<Option<ExecutionProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `stage` with `total` steps to go.
    pub fn enter(&self, stage: ExecutionStage, total: usize) {
        self.update(|p| {
            *p = Some(ExecutionProgress {
                stage,
                done: 0,
                total: u32::try_from(total).unwrap_or(u32::MAX),
            })
        });
    }

    /// One more step of the current stage is done.
    pub fn step(&self) {
        self.update(|p| {
            if let Some(progress) = p {
                progress.done = progress.done.saturating_add(1).min(progress.total);
            }
        });
    }

    pub fn clear(&self) {
        self.update(|p| *p = None);
    }

    pub fn snapshot(&self) -> Option<ExecutionProgress> {
        self.inner.lock().ok().and_then(|p| *p)
    }

    // Best effort: a poisoned lock is ignored.
    fn update(&self, f: impl FnOnce(&mut Option<ExecutionProgress>)) {
        if let Ok(mut p) = self.inner.lock() {
            f(&mut p);
        }
    }
}
