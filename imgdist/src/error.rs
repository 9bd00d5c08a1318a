use config::ConfigError;
use ociclient::OciDigest;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A reference could not be mapped to remote content
    #[error("Failed to resolve {reference}: {reason}")]
    Resolve { reference: String, reason: String },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: OciDigest, actual: OciDigest },

    #[error("Size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch { digest: OciDigest, expected: u64, actual: u64 },

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("Storage error: {0}")]
    Storage(#[from] opendal::Error),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unpack failed: {0}")]
    Unpack(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn resolve(reference: impl Into<String>, reason: impl ToString) -> Self {
        Error::Resolve {
            reference: reference.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
