use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Job;

/// One content collection inside a job's `source_ref` (e.g. one feed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub id: String,
    #[serde(default)]
    pub label: String,
}

/// A fetched item waiting to be summarized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Id of the [`SourceUnit`] it came from.
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub item: ContentItem,
    pub text: String,
}

/// A single source unit could not be used. Never fatal to an execution.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source unit '{unit}' unreachable: {reason}")]
    Unreachable { unit: String, reason: String },

    #[error("source unit '{unit}' returned invalid content: {reason}")]
    Invalid { unit: String, reason: String },
}

/// A stage failure that ends the execution as `failed`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("cannot resolve source '{source_ref}': {reason}")]
    Resolve { source_ref: String, reason: String },

    #[error("{stage} stage failed: {reason}")]
    Stage { stage: &'static str, reason: String },
}

/// Outcome of one outbound model call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("model call failed: {0}")]
    Failed(String),
}

/// External fetch/summarize/compose/publish collaborator.
///
/// The runner drives the stages in order and owns all rate limiting; an
/// implementation performs exactly one unit of work per call.
#[async_trait]
pub trait ContentPipeline: Send + Sync {
    /// Expand a job's `source_ref` into its source units.
    async fn resolve_sources(&self, source_ref: &str) -> Result<Vec<SourceUnit>, PipelineError>;

    /// Fetch at most `limit` items from one unit.
    async fn fetch_items(
        &self,
        unit: &SourceUnit,
        limit: usize,
    ) -> Result<Vec<ContentItem>, SourceError>;

    async fn summarize(&self, item: &ContentItem, model: &str) -> Result<String, ModelError>;

    /// Merge the item summaries into one piece of content.
    async fn compose(&self, summaries: &[Summary], model: &str) -> Result<String, ModelError>;

    /// Write the artifacts (text, audio) and return their references.
    async fn publish(
        &self,
        job: &Job,
        composition: &str,
        summaries: &[Summary],
    ) -> Result<Vec<String>, PipelineError>;
}
