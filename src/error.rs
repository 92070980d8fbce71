use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GodoError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("download failed: {url} (HTTP {status})")]
    HttpStatus { url: String, status: u16 },
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("pattern error: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("process error: {0}")]
    Process(String),
    #[error("{message}\n  {hint}")]
    Precondition { message: String, hint: String },
    #[error(
        "unable to detect terminal type\n  supported: {supported}\n  current TERM_PROGRAM: {observed}"
    )]
    UnknownTerminal { observed: String, supported: String },
}

impl GodoError {
    pub fn precondition(message: impl Into<String>, hint: impl Into<String>) -> Self {
        GodoError::Precondition {
            message: message.into(),
            hint: hint.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GodoError>;
