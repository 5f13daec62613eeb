use thiserror::Error;

#[derive(Debug, Error)]
pub enum NewsroomError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NewsroomError {
    /// Short error code string used in logs and API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            NewsroomError::Config(_) => "CONFIG_ERROR",
            NewsroomError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, NewsroomError>;
