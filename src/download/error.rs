//! Error taxonomy for script acquisition.

use thiserror::Error;

use crate::cancel::Cancelled;

/// Errors raised while locating or fetching a script.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DownloadError {
    /// Raised when a URL does not match the shape a source requires.
    #[error("provided {kind} URL is not in the correct format: {url}; expected {example}")]
    UrlFormat {
        /// Source family that rejected the URL (for example `GitHub`).
        kind: String,
        /// URL as supplied by the caller.
        url: String,
        /// Example of the accepted shape.
        example: String,
    },
    /// Raised when the server replies outside the 2xx range.
    #[error(
        "failed to {action}: {status} {reason}. Please make sure the URL is valid, and the credentials are correct"
    )]
    HttpStatus {
        /// What the request was trying to do.
        action: String,
        /// HTTP status code.
        status: u16,
        /// Canonical reason phrase for the status.
        reason: String,
        /// URL that produced the status.
        url: String,
    },
    /// Raised when no file name with an allowed extension can be found.
    #[error("script file of supported types: '.sh', '.bash', '.ps1' was not found")]
    UnsupportedFileType {
        /// Candidate name that was rejected, when one was available.
        name: Option<String>,
    },
    /// Raised when a successful response carries an HTML page.
    #[error("failed to download script file: {url} points to an html file")]
    NotAScript {
        /// URL the page was served from.
        url: String,
    },
    /// Raised when a directory listing has no `main.{sh,bash,ps1}` entry.
    #[error(
        "main file doesn't exist in '{path}'. When providing url to directory a script file with the name main.ps1|main.sh|main.bash must exist in the folder"
    )]
    MainFileNotFound {
        /// Directory path that was listed.
        path: String,
    },
    /// Raised when a source only supports single-file URLs.
    #[error("{kind} URL points to a directory; only single script files are supported: {url}")]
    DirectoryNotSupported {
        /// Source family that rejected the directory.
        kind: String,
        /// URL as supplied by the caller.
        url: String,
    },
    /// Raised when a script body is not valid UTF-8.
    #[error("script '{name}' is not valid UTF-8 text")]
    InvalidEncoding {
        /// Name of the offending script.
        name: String,
    },
    /// Raised when an API reply cannot be decoded.
    #[error("unexpected response from {url}: {message}")]
    InvalidPayload {
        /// URL that produced the payload.
        url: String,
        /// Decoder error message.
        message: String,
    },
    /// Raised when the request itself fails (DNS, TLS, connection, timeout).
    #[error("request to {url} failed: {message}")]
    Request {
        /// URL that was requested.
        url: String,
        /// Client error message.
        message: String,
    },
    /// Raised when the caller cancelled the download.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl DownloadError {
    pub(crate) fn request(url: impl Into<String>, err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("timed out: {err}")
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        };
        Self::Request {
            url: url.into(),
            message,
        }
    }

    pub(crate) fn payload(url: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidPayload {
            url: url.into(),
            message: message.to_string(),
        }
    }
}
