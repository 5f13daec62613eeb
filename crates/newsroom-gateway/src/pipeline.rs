//! Content pipeline backed by an external program.
//!
//! Every stage is one process invocation: the request is written to stdin as
//! a JSON object with a `stage` field and the reply is read from stdout.
//! A reply carrying an `error` field (optionally with `retry_after_ms`) is a
//! reported failure; a non-zero exit or unparseable stdout is a process failure.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use newsroom_core::config::PipelineConfig;
use newsroom_scheduler::pipeline::{
    ContentItem, ContentPipeline, ModelError, PipelineError, SourceError, SourceUnit, Summary,
};
use newsroom_scheduler::Job;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
enum StageFailure {
    #[error("{0}")]
    Process(String),

    #[error("{message}")]
    Reported {
        message: String,
        retry_after_ms: Option<u64>,
    },
}

#[derive(Deserialize)]
struct UnitsReply {
    units: Vec<SourceUnit>,
}

#[derive(Deserialize)]
struct ItemsReply {
    items: Vec<ContentItem>,
}

#[derive(Deserialize)]
struct TextReply {
    text: String,
}

#[derive(Deserialize)]
struct OutputsReply {
    outputs: Vec<String>,
}

pub struct CommandPipeline {
    command: String,
    args: Vec<String>,
    output_dir: String,
    timeout: Duration,
}

impl CommandPipeline {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            output_dir: cfg.output_dir.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
        }
    }

    async fn invoke<T: DeserializeOwned>(&self, stage: &'static str, request: Value) -> Result<T, StageFailure> {
        let payload = request.to_string();
        debug!(stage, command = %self.command, bytes = payload.len(), "invoking pipeline stage");

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .env("NEWSROOM_STAGE", stage)
            .env("NEWSROOM_OUTPUT_DIR", &self.output_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StageFailure::Process(format!("pipeline program '{}' not found", self.command))
            } else {
                StageFailure::Process(format!("failed to spawn pipeline program: {e}"))
            }
        })?;

        // One deadline for writing the request and waiting for the reply.
        let exchange = async move {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(StageFailure::Process(format!("failed to write request: {e}")));
                    }
                }
                drop(stdin);
            }
            child
                .wait_with_output()
                .await
                .map_err(|e| StageFailure::Process(format!("pipeline process error: {e}")))
        };
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                StageFailure::Process(format!("{stage} timed out after {}s", self.timeout.as_secs()))
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply: Option<Value> = serde_json::from_str(stdout.trim()).ok();

        if let Some(err) = reply.as_ref().and_then(|v| v.get("error")).and_then(Value::as_str) {
            return Err(StageFailure::Reported {
                message: err.to_string(),
                retry_after_ms: reply
                    .as_ref()
                    .and_then(|v| v.get("retry_after_ms"))
                    .and_then(Value::as_u64),
            });
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            return Err(StageFailure::Process(format!(
                "{stage} exited with code {code}: {}",
                truncate(stderr.trim(), 300)
            )));
        }

        let value = reply.ok_or_else(|| {
            StageFailure::Process(format!(
                "{stage} returned invalid JSON: {}",
                truncate(stdout.trim(), 300)
            ))
        })?;
        serde_json::from_value(value)
            .map_err(|e| StageFailure::Process(format!("{stage} reply has unexpected shape: {e}")))
    }
}

fn model_error(failure: StageFailure) -> ModelError {
    match failure {
        StageFailure::Reported {
            retry_after_ms: Some(retry_after_ms),
            ..
        } => ModelError::RateLimited { retry_after_ms },
        other => ModelError::Failed(other.to_string()),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl ContentPipeline for CommandPipeline {
    async fn resolve_sources(&self, source_ref: &str) -> Result<Vec<SourceUnit>, PipelineError> {
        let reply: UnitsReply = self
            .invoke("resolve", json!({ "stage": "resolve", "source_ref": source_ref }))
            .await
            .map_err(|e| PipelineError::Resolve {
                source_ref: source_ref.to_string(),
                reason: e.to_string(),
            })?;
        Ok(reply.units)
    }

    async fn fetch_items(&self, unit: &SourceUnit, limit: usize) -> Result<Vec<ContentItem>, SourceError> {
        let reply: ItemsReply = self
            .invoke("fetch", json!({ "stage": "fetch", "unit": unit, "limit": limit }))
            .await
            .map_err(|e| match e {
                StageFailure::Reported { message, .. } => SourceError::Unreachable {
                    unit: unit.id.clone(),
                    reason: message,
                },
                StageFailure::Process(reason) => SourceError::Invalid {
                    unit: unit.id.clone(),
                    reason,
                },
            })?;
        Ok(reply.items)
    }

    async fn summarize(&self, item: &ContentItem, model: &str) -> Result<String, ModelError> {
        let reply: TextReply = self
            .invoke("summarize", json!({ "stage": "summarize", "item": item, "model": model }))
            .await
            .map_err(model_error)?;
        Ok(reply.text)
    }

    async fn compose(&self, summaries: &[Summary], model: &str) -> Result<String, ModelError> {
        let reply: TextReply = self
            .invoke("compose", json!({ "stage": "compose", "summaries": summaries, "model": model }))
            .await
            .map_err(model_error)?;
        Ok(reply.text)
    }

    async fn publish(&self, job: &Job, composition: &str, summaries: &[Summary]) -> Result<Vec<String>, PipelineError> {
        let request = json!({
            "stage": "publish",
            "job": { "id": job.id, "name": job.name, "source_ref": job.source_ref },
            "composition": composition,
            "summaries": summaries,
        });
        let reply: OutputsReply = self
            .invoke("publish", request)
            .await
            .map_err(|e| PipelineError::Stage {
                stage: "publish",
                reason: e.to_string(),
            })?;
        Ok(reply.outputs)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn pipeline(script: &str) -> CommandPipeline {
        CommandPipeline::new(&PipelineConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            output_dir: "/tmp/newsroom-test".into(),
            timeout_secs: 5,
        })
    }

    fn item() -> ContentItem {
        ContentItem {
            source: "tech".into(),
            title: "Rust 2024".into(),
            link: String::new(),
            body: None,
        }
    }

    #[tokio::test]
    async fn resolve_reads_units_from_stdout() {
        let p = pipeline(r#"cat >/dev/null; echo '{"units":[{"id":"hn","label":"Hacker News"},{"id":"lwn"}]}'"#);
        let units = p.resolve_sources("tech").await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].label, "Hacker News");
        assert_eq!(units[1].id, "lwn");
    }

    #[tokio::test]
    async fn request_carries_stage_and_environment() {
        let p = pipeline(
            r#"req=$(cat); case "$req" in *'"stage":"summarize"'*) printf '{"text":"%s"}' "$NEWSROOM_OUTPUT_DIR";; *) echo '{"error":"wrong stage"}';; esac"#,
        );
        let text = p.summarize(&item(), "small").await.unwrap();
        assert_eq!(text, "/tmp/newsroom-test");
    }

    #[tokio::test]
    async fn retry_after_maps_to_rate_limited() {
        let p = pipeline(r#"cat >/dev/null; echo '{"error":"slow down","retry_after_ms":1500}'"#);
        assert_eq!(
            p.summarize(&item(), "small").await,
            Err(ModelError::RateLimited { retry_after_ms: 1500 })
        );

        let p = pipeline(r#"cat >/dev/null; echo '{"error":"context too long"}'"#);
        assert_eq!(
            p.compose(&[], "large").await,
            Err(ModelError::Failed("context too long".into()))
        );
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_stage_failure() {
        let p = pipeline("cat >/dev/null; echo boom >&2; exit 3");
        let unit = SourceUnit { id: "hn".into(), label: String::new() };
        match p.fetch_items(&unit, 2).await {
            Err(SourceError::Invalid { unit, reason }) => {
                assert_eq!(unit, "hn");
                assert!(reason.contains("code 3"));
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_fails_resolve() {
        let p = CommandPipeline::new(&PipelineConfig {
            command: "/nonexistent/newsroom-pipeline".into(),
            ..PipelineConfig::default()
        });
        assert!(matches!(
            p.resolve_sources("tech").await,
            Err(PipelineError::Resolve { .. })
        ));
    }

    #[tokio::test]
    async fn deadline_covers_a_request_the_child_never_reads() {
        let mut p = pipeline("sleep 5");
        p.timeout = Duration::from_millis(300);
        let big = ContentItem {
            body: Some("x".repeat(512 * 1024)),
            ..item()
        };

        let started = std::time::Instant::now();
        match p.summarize(&big, "small").await {
            Err(ModelError::Failed(reason)) => assert!(reason.contains("timed out"), "{reason}"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn slow_stage_times_out() {
        let mut p = pipeline("sleep 5");
        p.timeout = Duration::from_millis(200);
        let err = p.compose(&[], "large").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
