use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use newsroom_core::config::NewsroomConfig;
use newsroom_scheduler::{
    ExecutionRunner, RateLimiter, SchedulerEngine, SchedulerHandle, SystemClock,
};
use tracing::{info, warn};

mod app;
mod http;
mod pipeline;

/// Unattended content-job scheduler with a JSON HTTP API.
#[derive(Debug, Parser)]
#[command(name = "newsroom-gateway", version)]
struct Cli {
    /// Config file; falls back to NEWSROOM_CONFIG, then ~/.newsroom/newsroom.toml.
    #[arg(short, long, env = "NEWSROOM_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "newsroom_gateway=info,newsroom_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = NewsroomConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "config load failed ({}), using defaults", e);
        NewsroomConfig::default()
    });

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path)?;
    ensure_dir(&config.pipeline.output_dir)?;
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

    // Handle and engine share one connection, so every read sees whole rows.
    let scheduler = SchedulerHandle::new(db, Arc::new(SystemClock))?;
    info!("database migrations complete");

    let pipeline = Arc::new(pipeline::CommandPipeline::new(&config.pipeline));
    let limiter = RateLimiter::from_config(&config.rate_limit);
    let runner = ExecutionRunner::new(pipeline, limiter);
    let engine = SchedulerEngine::new(&scheduler, runner, &config.scheduler);
    info!(command = %config.pipeline.command, "content pipeline configured");

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, scheduler));
    let router = app::build_router(state);

    // spawn scheduler engine loop in background
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(async move { engine.run(shutdown_rx).await });

    info!("newsroom gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
            }
            info!("shutdown requested");
        })
        .await?;

    // signal scheduler to stop; it finishes the execution in flight first
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }
    Ok(())
}

fn ensure_parent_dir(path: &str) -> newsroom_core::Result<()> {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(&parent.to_string_lossy()),
        _ => Ok(()),
    }
}

fn ensure_dir(path: &str) -> newsroom_core::Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}
