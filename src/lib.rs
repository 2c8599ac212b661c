//! Core library for fetching automation scripts and running them on remote
//! hosts.
//!
//! The [`download`] layer turns a URL plus optional credentials into
//! [`ScriptsData`], choosing between plain HTTP(S), a GitHub-style contents
//! API and a GitLab-style files API. The [`remote`] layer uploads the result
//! to a target host over WinRM or SSH, runs it, forwards its output to an
//! [`OutputSink`] and removes every temporary resource again. Both honour a
//! shared [`CancellationSampler`].

pub mod cancel;
pub mod download;
pub mod host;
pub mod output;
pub mod remote;
pub mod script;
pub mod test_support;

pub use cancel::{CancellationSampler, Cancelled};
pub use download::{DownloadConfig, DownloadDispatcher, DownloadError, HttpAuth, SourceDownloader};
pub use host::{ConnectionMethod, HostConfigError, HostConfiguration, HostConfigurationBuilder};
pub use output::{OutputSink, WriterSink};
pub use remote::{
    AnyShell, Dialect, ExecutionConfig, ExecutionError, RemoteCommandResult,
    RemoteExecutionSession, RemoteShell, TransportError,
};
pub use script::{ScriptFile, ScriptsData};
