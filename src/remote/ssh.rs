//! [`RemoteShell`] over the system `ssh` client.
//!
//! Every command is a separate `ssh` child process. The shell handle is
//! local bookkeeping only; the command handle owns the child until its
//! output is collected or it is cleaned up.

use std::collections::HashMap;
use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    CommandId, Dialect, ExecutionConfig, RemoteCommandResult, RemoteShell, ShellFuture, ShellId,
    TransportError,
};
use crate::host::HostConfiguration;

/// Exit status `ssh` reserves for its own failures.
const SSH_FAILURE_STATUS: i32 = 255;
const DEFAULT_SSH_PORT: u16 = 22;

/// Runs commands by spawning `ssh user@host <command>`.
///
/// Until one command has come back with a status other than 255, that status
/// is read as the client failing to reach the host. Afterwards 255 is an
/// ordinary exit status of the remote command.
#[derive(Debug)]
pub struct SshShell {
    ssh_bin: String,
    options: Vec<OsString>,
    destination: String,
    children: Mutex<HashMap<CommandId, Child>>,
    reached: AtomicBool,
}

impl SshShell {
    /// Prepares an SSH shell for `host` using the client settings in
    /// `config`.
    #[must_use]
    pub fn new(host: &HostConfiguration, config: &ExecutionConfig) -> Self {
        Self {
            ssh_bin: config.ssh_bin.clone(),
            options: common_ssh_options(host, config),
            destination: format!("{}@{}", host.username, host.address),
            children: Mutex::new(HashMap::new()),
            reached: AtomicBool::new(false),
        }
    }

    /// Arguments passed to `ssh` for `command`, program name excluded.
    #[must_use]
    pub fn ssh_args(&self, command: &str) -> Vec<OsString> {
        let mut args = self.options.clone();
        args.push(OsString::from(&self.destination));
        args.push(OsString::from(command));
        args
    }

    fn spawn(&self, command: &str) -> Result<Child, TransportError> {
        Command::new(&self.ssh_bin)
            .args(self.ssh_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                TransportError::other(format!("failed to spawn {}: {err}", self.ssh_bin))
            })
    }

    fn take_child(&self, command: &CommandId) -> Result<Option<Child>, TransportError> {
        self.children
            .lock()
            .map(|mut children| children.remove(command))
            .map_err(|_| TransportError::other("ssh command table lock poisoned"))
    }

    async fn collect(&self, command: &CommandId) -> Result<RemoteCommandResult, TransportError> {
        let child = self.take_child(command)?.ok_or_else(|| {
            TransportError::other(format!("unknown or finished ssh command {command}"))
        })?;
        let output = child.wait_with_output().await.map_err(|err| {
            TransportError::other(format!("failed to wait for {}: {err}", self.ssh_bin))
        })?;
        self.classify(RemoteCommandResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn classify(
        &self,
        result: RemoteCommandResult,
    ) -> Result<RemoteCommandResult, TransportError> {
        if result.exit_code == SSH_FAILURE_STATUS && !self.reached.load(Ordering::Acquire) {
            return Err(TransportError::Connect {
                endpoint: self.destination.clone(),
                message: result.stderr.trim().to_owned(),
            });
        }
        self.reached.store(true, Ordering::Release);
        Ok(result)
    }
}

impl RemoteShell for SshShell {
    fn dialect(&self) -> Dialect {
        Dialect::Posix
    }

    fn open_shell(&self) -> ShellFuture<'_, ShellId> {
        Box::pin(async { Ok(ShellId::new(format!("ssh-{}", Uuid::new_v4()))) })
    }

    fn run_command<'a>(
        &'a self,
        shell: &'a ShellId,
        command: &'a str,
    ) -> ShellFuture<'a, CommandId> {
        Box::pin(async move {
            let child = self.spawn(command)?;
            let id = CommandId::new(Uuid::new_v4().to_string());
            debug!(shell = %shell, command_id = %id, pid = ?child.id(), "started ssh command");
            self.children
                .lock()
                .map_err(|_| TransportError::other("ssh command table lock poisoned"))?
                .insert(id.clone(), child);
            Ok(id)
        })
    }

    fn command_output<'a>(
        &'a self,
        _shell: &'a ShellId,
        command: &'a CommandId,
    ) -> ShellFuture<'a, RemoteCommandResult> {
        Box::pin(self.collect(command))
    }

    fn cleanup_command<'a>(
        &'a self,
        _shell: &'a ShellId,
        command: &'a CommandId,
    ) -> ShellFuture<'a, ()> {
        Box::pin(async move {
            if let Some(mut child) = self.take_child(command)? {
                if let Err(err) = child.kill().await {
                    warn!(command_id = %command, error = %err, "failed to kill ssh command");
                }
            }
            Ok(())
        })
    }

    fn close_shell<'a>(&'a self, _shell: &'a ShellId) -> ShellFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

fn common_ssh_options(host: &HostConfiguration, config: &ExecutionConfig) -> Vec<OsString> {
    let port = host.port.unwrap_or(DEFAULT_SSH_PORT);
    let mut args = vec![OsString::from("-p"), OsString::from(port.to_string())];

    if let Some(ref identity_file) = host.identity_file {
        args.push(OsString::from("-i"));
        args.push(OsString::from(expand_tilde(identity_file)));
    }

    if config.ssh_batch_mode {
        args.push(OsString::from("-o"));
        args.push(OsString::from("BatchMode=yes"));
    }

    if !config.ssh_strict_host_key_checking {
        args.push(OsString::from("-o"));
        args.push(OsString::from("StrictHostKeyChecking=no"));
    }

    if !config.ssh_known_hosts_file.trim().is_empty() {
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "UserKnownHostsFile={}",
            config.ssh_known_hosts_file
        )));
    }

    args
}

/// Expands a leading `~/` to `$HOME`; other paths are returned unchanged.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
