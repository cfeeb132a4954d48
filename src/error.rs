use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("GitHub API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("GitHub API rate limit exceeded, resets at {reset}")]
    RateLimited { reset: DateTime<Utc> },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExporterError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// The instant the upstream limiter allows requests again, for rate-limit errors.
    pub fn reset_instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RateLimited { reset } => Some(*reset),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;
