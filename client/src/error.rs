use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectorError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("connection to the host was lost")]
    Disconnected,

    #[error("no reply tagged {tags:?} after {attempts} attempt(s)")]
    Timeout { tags: Vec<String>, attempts: u32 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rating computation failed: {0}")]
    Rating(String),

    #[error("archival failed: {0}")]
    Archive(String),

    #[error("persistence failed: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DirectorError {
    /// Errors that mean the remote host and local state may have diverged.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            DirectorError::Disconnected | DirectorError::Timeout { .. } | DirectorError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DirectorError>;
