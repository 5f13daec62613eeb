use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::limiter::RateLimiter;
use crate::pipeline::{ContentItem, ContentPipeline, Summary};
use crate::progress::ProgressTracker;
use crate::types::{ExecutionOutcome, ExecutionStage, Job};

/// Runs one job through the content pipeline and reports a terminal outcome.
///
/// Never returns an error: every failure is folded into a `failed` outcome.
pub struct ExecutionRunner {
    pipeline: Arc<dyn ContentPipeline>,
    limiter: RateLimiter,
}

impl ExecutionRunner {
    pub fn new(pipeline: Arc<dyn ContentPipeline>, limiter: RateLimiter) -> Self {
        Self { pipeline, limiter }
    }

    /// Run `job` once, reporting each pipeline phase to `progress`.
    pub async fn run(&self, job: &Job, progress: &ProgressTracker) -> ExecutionOutcome {
        progress.enter(ExecutionStage::Resolving, 0);
        let units = match self.pipeline.resolve_sources(&job.source_ref).await {
            Ok(units) if units.is_empty() => {
                return ExecutionOutcome::failed(
                    format!("source '{}' has no source units", job.source_ref),
                    0,
                );
            }
            Ok(units) => units,
            Err(e) => return ExecutionOutcome::failed(e.to_string(), 0),
        };

        let limit = usize::from(job.volume);
        let mut items: Vec<ContentItem> = Vec::new();
        progress.enter(ExecutionStage::Fetching, units.len());
        for unit in &units {
            match self.pipeline.fetch_items(unit, limit).await {
                Ok(mut fetched) => {
                    fetched.truncate(limit);
                    debug!(job_id = %job.id, unit = %unit.id, count = fetched.len(), "source unit fetched");
                    items.extend(fetched);
                }
                Err(e) => warn!(job_id = %job.id, unit = %unit.id, error = %e, "skipping source unit"),
            }
            progress.step();
        }
        if items.is_empty() {
            return ExecutionOutcome::failed("no usable items from any source unit", 0);
        }

        // Summaries are produced one at a time so the limiter sees a strict sequence.
        let mut summaries = Vec::with_capacity(items.len());
        progress.enter(ExecutionStage::Summarizing, items.len());
        for item in items {
            let model = job.summary_model();
            let result = self
                .limiter
                .call("summarize", || self.pipeline.summarize(&item, model))
                .await;
            match result {
                Ok(text) => summaries.push(Summary { item, text }),
                Err(e) => warn!(job_id = %job.id, title = %item.title, error = %e, "item summary failed"),
            }
            progress.step();
        }
        let item_count = summaries.len() as u32;
        if summaries.is_empty() {
            return ExecutionOutcome::failed("every item failed to summarize", 0);
        }

        progress.enter(ExecutionStage::Composing, 0);
        let composition = match self
            .limiter
            .call("compose", || self.pipeline.compose(&summaries, job.compose_model()))
            .await
        {
            Ok(text) => text,
            Err(e) => return ExecutionOutcome::failed(format!("compose: {e}"), item_count),
        };

        progress.enter(ExecutionStage::Publishing, 0);
        match self.pipeline.publish(job, &composition, &summaries).await {
            Ok(outputs) => {
                info!(job_id = %job.id, item_count, outputs = outputs.len(), "execution produced output");
                ExecutionOutcome::completed(outputs, item_count)
            }
            Err(e) => ExecutionOutcome::failed(e.to_string(), item_count),
        }
    }
}
