//! Shared configuration and process-level error types for the newsroom workspace.

pub mod config;
pub mod error;

pub use config::NewsroomConfig;
pub use error::{NewsroomError, Result};
