//! Error types for visor.

use thiserror::Error;

/// Result type alias using visor's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for visor operations.
///
/// The first group of variants are request errors: they describe a
/// malformed or ill-timed client request and are always reported back to
/// the caller. None of them are fatal to the process.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or ill-timed client request (empty id, unknown id, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A query state guard was violated
    #[error("Wrong query status: {0}")]
    WrongQueryStatus(String),

    /// Training could not be started or did not complete
    #[error("Training error: {0}")]
    Training(String),

    /// Ranking is unavailable or the requested page is out of range
    #[error("Cannot return ranking: {0}")]
    CannotReturnRanking(String),

    /// Annotation file could not be parsed
    #[error("Invalid annotation file: {0}")]
    InvalidAnnoFile(String),

    /// Incremental dataset index update failed
    #[error("Invalid dataset incremental update: {0}")]
    InvalidDsetIncrementalUpdate(String),

    /// Image failed validation (wrong channel count, empty, undecodable)
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Feature matrices or vectors do not share a column width
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A single-subscriber queue already has a waiting subscriber
    #[error("Already subscribed: {0}")]
    AlreadySubscribed(String),

    /// Feature file is truncated or has an unknown layout
    #[error("Feature file error: {0}")]
    FeatureFile(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error belongs to the invalid-request family.
    ///
    /// Request errors are the caller's fault and are reported verbatim;
    /// everything else is a server-side failure.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_)
                | Error::WrongQueryStatus(_)
                | Error::Training(_)
                | Error::CannotReturnRanking(_)
                | Error::InvalidAnnoFile(_)
                | Error::InvalidDsetIncrementalUpdate(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        match e {
            image::ImageError::IoError(io) => Error::Io(io),
            other => Error::InvalidImage(other.to_string()),
        }
    }
}
