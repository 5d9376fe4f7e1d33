use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("failed to launch dump process: {0}")]
    Launch(String),

    /// Carries the dump tool's own message, starting at its error marker when present.
    #[error("{0}")]
    Dump(String),

    #[error("backup wrote 0 bytes")]
    EmptyDump,

    #[error("compression failed")]
    Compression(#[source] std::io::Error),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("storage request failed: {0}")]
    Storage(String),

    #[error("bucket access check failed: {0}")]
    BucketAccess(String),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Every problem found while reading configuration, reported together.
#[derive(Error, Debug)]
#[error("invalid configuration:\n  {}", .problems.join("\n  "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

pub type Result<T> = std::result::Result<T, BackupError>;
