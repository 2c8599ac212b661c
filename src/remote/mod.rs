//! Remote execution over WinRM or SSH.
//!
//! A [`RemoteShell`] dispatches one command at a time through handle-scoped
//! operations (open a shell, start a command, collect its output, release
//! both handles). [`RemoteExecutionSession`] layers the script life cycle on
//! top: create a temporary folder, upload the script in chunks, run it and
//! remove the folder again, sampling cancellation while it waits.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

mod clixml;
mod config;
mod dialect;
mod error;
mod session;
mod ssh;
mod winrm;
mod xml;

pub use clixml::{CLIXML_MARKER, decode_stderr, unescape_code_units};
pub use config::{DEFAULT_CHUNK_SIZE, ExecutionConfig, ExecutionConfigError};
pub use dialect::{Dialect, encode_powershell};
pub use error::{ExecutionError, TIMEOUT_ERROR_CODE, TransportError};
pub use session::{AnyShell, RemoteExecutionSession};
pub use ssh::SshShell;
pub use winrm::{WinRmEndpoint, WinRmShell};

/// Future returned by [`RemoteShell`] operations.
pub type ShellFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Handle of an open remote shell.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ShellId(String);

impl ShellId {
    /// Wraps a transport-issued identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Identifier as issued by the transport.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle of a command started inside a shell.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CommandId(String);

impl CommandId {
    /// Wraps a transport-issued identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Identifier as issued by the transport.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of one remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteCommandResult {
    /// Exit code reported by the target.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error, possibly CLIXML-encoded.
    pub stderr: String,
}

impl RemoteCommandResult {
    /// Returns `true` when the command exited with code zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Remote command protocol with explicit shell and command handles.
///
/// Callers must release every handle they acquire: `cleanup_command` for
/// each started command and `close_shell` for each opened shell, on every
/// exit path.
pub trait RemoteShell: Send + Sync {
    /// Command language spoken by the target.
    fn dialect(&self) -> Dialect;

    /// Opens a shell on the target.
    fn open_shell(&self) -> ShellFuture<'_, ShellId>;

    /// Starts `command` inside `shell` without waiting for it.
    fn run_command<'a>(&'a self, shell: &'a ShellId, command: &'a str)
    -> ShellFuture<'a, CommandId>;

    /// Waits for `command` to finish and returns its output.
    ///
    /// Dropping the future abandons the wait; the command keeps its handle
    /// until [`RemoteShell::cleanup_command`] runs.
    fn command_output<'a>(
        &'a self,
        shell: &'a ShellId,
        command: &'a CommandId,
    ) -> ShellFuture<'a, RemoteCommandResult>;

    /// Terminates `command` if still running and releases its handle.
    fn cleanup_command<'a>(
        &'a self,
        shell: &'a ShellId,
        command: &'a CommandId,
    ) -> ShellFuture<'a, ()>;

    /// Releases `shell`.
    fn close_shell<'a>(&'a self, shell: &'a ShellId) -> ShellFuture<'a, ()>;
}
