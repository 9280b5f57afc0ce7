use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found at `{0}`")]
    NotFound(PathBuf),
    #[error("config file malformed: {0}")]
    Malformed(String),
    #[error("invalid service `{name}`: {reason}")]
    InvalidService { name: String, reason: String },
}
