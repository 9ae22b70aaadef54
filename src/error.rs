// Media Assistant Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("No parser found for extension: {0}")]
    NoParser(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("External parser error: {0}")]
    ExternalParser(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Media queue stopped")]
    QueueStopped,

    #[error("{0}")]
    Other(String),
}

impl MediaError {
    /// Transient failures are retried up to the attempt limit; everything
    /// else fails the asset on the first occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MediaError::Io(_) | MediaError::DeadlineExceeded | MediaError::Tool(_)
        )
    }

    /// Cancellation is not a failure: the task is left for the next startup.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MediaError::Cancelled)
    }

    /// Cancellation or deadline expiry. Parsers propagate these instead of
    /// recording them as soft annotations.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, MediaError::Cancelled | MediaError::DeadlineExceeded)
    }
}

impl From<anyhow::Error> for MediaError {
    fn from(err: anyhow::Error) -> Self {
        MediaError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = MediaError::Io(std::io::Error::new(std::io::ErrorKind::Other, "locked"));
        assert!(io.is_transient());
        assert!(MediaError::DeadlineExceeded.is_transient());
        assert!(!MediaError::Parse("corrupt".into()).is_transient());
        assert!(!MediaError::NoParser("xyz".into()).is_transient());
        assert!(!MediaError::Cancelled.is_transient());
        assert!(MediaError::Cancelled.is_cancelled());
        assert!(MediaError::DeadlineExceeded.is_interrupt());
        assert!(!MediaError::Tool("ffprobe not found".into()).is_interrupt());
    }
}
