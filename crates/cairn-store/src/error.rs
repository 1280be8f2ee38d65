use cairn_shared::CryptoError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Error from the HTTP client talking to the content store.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The content store could not be reached at all.
    #[error("Content store unavailable: {0}")]
    Unavailable(String),

    /// The content store answered with a non-success status.
    #[error("Content store returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Bad key, tampered or truncated token, or a payload over the size cap.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure reading or writing the bucket hash registry.
    #[error("Registry error: {0}")]
    Registry(String),

    /// SQLite error from the registry database.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A hash or record that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A peer message missing required fields.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

impl StoreError {
    /// Only transport failures are worth another attempt. Builder, MIME and
    /// body-decode errors from the HTTP client fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            StoreError::Unavailable(_) => true,
            _ => false,
        }
    }

    pub fn is_decryption(&self) -> bool {
        matches!(self, StoreError::Crypto(CryptoError::DecryptionFailed))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
