//! Error types for remote shells and execution sessions.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::ExecutionConfigError;
use crate::cancel::Cancelled;

/// Winsock `WSAETIMEDOUT`, reported for connection timeouts.
pub const TIMEOUT_ERROR_CODE: i32 = 10060;

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static OS_ERROR_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[Errno (\d+)\]|os error (\d+)").expect("valid os error pattern")
});

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static PROTOCOL_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Code (\d+)").expect("valid protocol code pattern"));

/// Failures raised by a [`super::RemoteShell`] transport.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The endpoint did not answer in time.
    #[error("connection to {endpoint} timed out: {message}")]
    Timeout {
        /// Endpoint that was contacted.
        endpoint: String,
        /// Underlying error text.
        message: String,
    },
    /// The connection could not be established.
    #[error("connection to {endpoint} failed: {message}")]
    Connect {
        /// Endpoint that was contacted.
        endpoint: String,
        /// Underlying error text, including any OS error number.
        message: String,
    },
    /// The remote service rejected or garbled the exchange.
    #[error("transport error from {endpoint}: {message}")]
    Protocol {
        /// Endpoint that was contacted.
        endpoint: String,
        /// Description carrying `Code <n>` when the service returned one.
        message: String,
    },
    /// Any other transport failure.
    #[error("transport failure: {message}")]
    Other {
        /// Underlying error text.
        message: String,
    },
}

impl TransportError {
    /// Numeric code reported to operators for a failed connection attempt.
    ///
    /// Timeouts map to [`TIMEOUT_ERROR_CODE`], connection failures to the OS
    /// error number in their text, protocol errors to their `Code <n>`, and
    /// everything else to `0`.
    #[must_use]
    pub fn connection_code(&self) -> i32 {
        match self {
            Self::Timeout { .. } => TIMEOUT_ERROR_CODE,
            Self::Connect { message, .. } => OS_ERROR_CODE
                .captures(message)
                .and_then(|found| found.get(1).or_else(|| found.get(2)))
                .and_then(|code| code.as_str().parse().ok())
                .unwrap_or(0),
            Self::Protocol { message, .. } => PROTOCOL_CODE
                .captures(message)
                .and_then(|found| found.get(1))
                .and_then(|code| code.as_str().parse().ok())
                .unwrap_or(0),
            Self::Other { .. } => 0,
        }
    }

    pub(crate) fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

/// Errors raised by [`super::RemoteExecutionSession`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecutionError {
    /// The connection probe failed.
    #[error("failed to connect to {host}: error code {code}: {message}")]
    Connection {
        /// Target host.
        host: String,
        /// Classified error code (see [`TransportError::connection_code`]).
        code: i32,
        /// Underlying error text.
        message: String,
    },
    /// An operation ran before [`super::RemoteExecutionSession::connect`].
    #[error("session is not connected; call connect() first")]
    NotConnected,
    /// The temporary folder could not be created.
    #[error("failed to create temp folder on target machine. Error: \n{stderr}")]
    TempFolder {
        /// Decoded stderr of the remote command.
        stderr: String,
    },
    /// A chunk could not be appended to the remote file.
    #[error("failed to copy script to target machine. Error: \n{stderr}")]
    Copy {
        /// Decoded stderr of the failing chunk command.
        stderr: String,
    },
    /// The script exited with a non-zero code.
    #[error("failed to run script on target machine (exit code {exit_code}). Error: \n{stderr}")]
    ScriptRun {
        /// Script exit code.
        exit_code: i32,
        /// Decoded stderr of the script.
        stderr: String,
    },
    /// The temporary folder could not be removed.
    #[error("failed to delete temp folder on target machine. Error: \n{stderr}")]
    DeleteTempFolder {
        /// Decoded stderr of the remote command.
        stderr: String,
    },
    /// An environment variable name cannot be expressed safely.
    #[error("invalid environment variable name '{name}': use letters, digits and underscores")]
    InvalidEnvVar {
        /// Offending name.
        name: String,
    },
    /// Execution settings failed validation.
    #[error(transparent)]
    InvalidConfig(#[from] ExecutionConfigError),
    /// The transport failed while a command was in flight.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The caller cancelled the execution.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}
