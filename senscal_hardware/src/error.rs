use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{path}: cannot parse `{value}`")]
    Parse { path: PathBuf, value: String },
    #[error("expected {expected} channels, got {got}")]
    ChannelCount { expected: usize, got: usize },
    #[error("no sensor entry `{0}`")]
    MissingEntry(String),
    #[error("sensor read timeout")]
    Timeout,
    #[error("simulated fault: {0}")]
    Simulated(&'static str),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
