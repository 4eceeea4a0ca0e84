//! Error handling for the egafetch library.
//!
//! All fallible operations in the crate return [`Result`], built on the
//! [`Error`] enum below. The enum doubles as the retry taxonomy: the
//! chunk downloader consults [`Error::is_retryable`] to decide whether a
//! failed attempt is worth repeating.

use std::io;
use thiserror::Error;

/// Errors that can happen while talking to EGA or writing to disk.
#[derive(Error, Debug)]
pub enum Error {
    /// Error from an underlying system that fits no other category.
    #[error("internal error: {0}")]
    Internal(String),

    /// The EGA API answered with a non-success status code.
    #[error("EGA API error ({status}): {body}")]
    Api {
        /// HTTP status code of the response.
        status: u16,
        /// Response body, as returned by the server.
        body: String,
    },

    /// Not authenticated, or the token endpoint rejected us.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The downloaded file does not match its expected checksum.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum the metadata API promised.
        expected: String,
        /// Checksum actually computed from the merged file.
        actual: String,
    },

    /// The operation was cancelled by the caller (e.g. Ctrl-C).
    #[error("operation cancelled")]
    Cancelled,

    /// The response body ended before the requested range was served.
    #[error("truncated response body: got {got} of {expected} bytes")]
    IncompleteBody {
        /// Bytes received before the body closed.
        got: u64,
        /// Bytes the range request asked for.
        expected: u64,
    },

    /// A file exhausted its download retries.
    #[error("download failed after {retries} retries: {message}")]
    DownloadFailed {
        /// File-level retries consumed.
        retries: u32,
        /// Last recorded error message.
        message: String,
    },

    /// Invalid user input (identifiers, sizes, missing files).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// I/O error while reading or writing local files.
    #[error("I/O error")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Transport-level error from the HTTP client.
    #[error("HTTP transport error")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    /// Error raised by the HTTP middleware stack.
    #[error("HTTP client error")]
    Middleware {
        #[from]
        source: reqwest_middleware::Error,
    },

    /// A state or manifest file could not be encoded or decoded.
    #[error("state serialization error")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Result type alias for operations that can fail with an egafetch error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a chunk attempt that failed with this error should be retried.
    ///
    /// Transport errors are matched before cancellation: some transport
    /// stacks wrap connect timeouts in a deadline-exceeded error, and those
    /// must stay retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http { .. } | Error::Middleware { .. } | Error::IncompleteBody { .. } => true,
            Error::Cancelled => false,
            Error::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
