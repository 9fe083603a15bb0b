//! Error types shared by the backend, the background jobs and the controller.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures a download or playlist load can end with.
///
/// Errors travel from background tasks to the UI thread through the event
/// channel, so they carry rendered messages instead of source errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The backend could not resolve or stream the media.
    #[error("Download error: {0}")]
    ExtractionFailed(String),

    /// Anything else that went wrong (spawn failure, IO, malformed output).
    #[error("Unexpected error: {0}")]
    UnexpectedFailure(String),

    /// The backend returned no enumerable entries for the URL.
    #[error("The URL does not contain a valid playlist")]
    NotAPlaylist,

    /// The unit of work was cancelled before it finished.
    #[error("Cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::UnexpectedFailure(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::UnexpectedFailure(format!("malformed backend output: {err}"))
    }
}
