use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DkError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("format error: {0}")]
    Format(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("{0}")]
    Cancelled(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl DkError {
    pub fn cancelled(message: impl Into<String>) -> Self {
        DkError::Cancelled(message.into())
    }
}
