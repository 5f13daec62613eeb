use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PIPELINE_COMMAND: &str = "newsroom-pipeline";

/// Top-level config (newsroom.toml + NEWSROOM_* env overrides).
///
/// Every section has defaults, so an empty or missing file yields a
/// runnable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewsroomConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Wake-up cadence of the scheduler loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-job scans. Override with NEWSROOM_SCHEDULER__POLL_INTERVAL_SECS.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl SchedulerConfig {
    /// Poll interval as a `Duration`, never shorter than one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

/// Pacing and backoff applied to every outbound model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum gap between the end of one model call and the start of the next.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// How many times a rate-limited call is retried before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// External program that implements the fetch/summarize/compose/publish stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory the program writes text and audio artifacts into.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Upper bound for a single stage invocation.
    #[serde(default = "default_stage_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            command: default_pipeline_command(),
            args: Vec::new(),
            output_dir: default_output_dir(),
            timeout_secs: default_stage_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_min_interval_ms() -> u64 {
    1_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    2_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_pipeline_command() -> String {
    DEFAULT_PIPELINE_COMMAND.to_string()
}
fn default_stage_timeout_secs() -> u64 {
    600
}
fn default_db_path() -> String {
    format!("{}/newsroom.db", home_dir())
}
fn default_output_dir() -> String {
    format!("{}/output", home_dir())
}

fn home_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.newsroom", home)
}

impl NewsroomConfig {
    /// Load config from a TOML file with NEWSROOM_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `NEWSROOM_RATE_LIMIT__MAX_RETRIES=5`. A missing file is not an error.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: NewsroomConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("NEWSROOM_").split("__"))
            .extract()
            .map_err(|e| crate::error::NewsroomError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    format!("{}/newsroom.toml", home_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = NewsroomConfig::load(Some("/nonexistent/newsroom.toml")).unwrap();
        assert_eq!(config.gateway.bind, DEFAULT_BIND);
        assert_eq!(config.rate_limit.max_retries, 3);
        assert_eq!(config.pipeline.command, DEFAULT_PIPELINE_COMMAND);
    }

    #[test]
    fn file_values_override_defaults() {
        let path = std::env::temp_dir().join(format!("newsroom-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[scheduler]\npoll_interval_secs = 90\n\n[rate_limit]\nmin_interval_ms = 250\n",
        )
        .unwrap();

        let config = NewsroomConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(90));
        assert_eq!(config.rate_limit.min_interval_ms, 250);
        assert_eq!(config.rate_limit.base_backoff_ms, 2_000);
    }

    #[test]
    fn poll_interval_is_clamped_to_one_second() {
        let config = SchedulerConfig {
            poll_interval_secs: 0,
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
