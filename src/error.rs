use thiserror::Error;

/// Error taxonomy for ingestion, fetch, and lifecycle operations.
///
/// `Unsupported` and `Blocked` are deterministic and not worth retrying.
/// `TransientIo` covers codec subprocess and store network failures; the
/// whole request may be retried by the caller, no internal retry loop
/// exists.
#[derive(Debug, Error)]
pub enum Error {
    /// Content type is incompatible with the target bucket policy, or the
    /// upload exceeds the bucket's size cap.
    #[error("unsupported file for this bucket")]
    Unsupported,

    /// Content hash matches the block-list.
    #[error("file content is blocked")]
    Blocked,

    /// No matching metadata record, bucket mismatch, or missing object.
    #[error("file not found")]
    NotFound,

    /// Subprocess or network failure. Scratch resources are released
    /// before this is surfaced.
    #[error("transient I/O failure: {0}")]
    TransientIo(#[from] anyhow::Error),
}

impl Error {
    /// Whether the caller may retry the whole request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientIo(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
