//! Script life cycle on one target host.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    CommandId, Dialect, ExecutionConfig, ExecutionError, RemoteCommandResult, RemoteShell,
    ShellFuture, ShellId, SshShell, TransportError, WinRmShell, decode_stderr,
};
use crate::cancel::{CancellationSampler, Cancelled};
use crate::host::{ConnectionMethod, HostConfiguration};
use crate::output::OutputSink;
use crate::script::{ScriptFile, ScriptsData};

/// Whether waiting for a command honours cancellation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Wait {
    Cancellable,
    ToCompletion,
}

/// Stateful connection to one target host.
///
/// Remote commands are issued one at a time. Each runs in its own shell;
/// both the shell and the command handle are released before the call
/// returns, including when the wait is cancelled.
#[derive(Debug)]
pub struct RemoteExecutionSession<S: RemoteShell> {
    host: HostConfiguration,
    shell: S,
    config: ExecutionConfig,
    cancel: CancellationSampler,
    connected: bool,
}

impl RemoteExecutionSession<AnyShell> {
    /// Builds the transport named by `host.connection` and wraps it in a
    /// session. WinRM hosts in automatic transport mode are probed here, and
    /// the probe is abandoned as soon as `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::InvalidConfig`] when `config` fails
    /// validation, [`ExecutionError::Transport`] when the transport
    /// cannot be built and [`ExecutionError::Cancelled`] when cancellation
    /// is observed while it is being built.
    pub async fn open(
        host: HostConfiguration,
        config: ExecutionConfig,
        cancel: CancellationSampler,
    ) -> Result<Self, ExecutionError> {
        config.validate()?;
        cancel.throw_if_cancelled()?;
        let shell = tokio::select! {
            biased;
            () = cancel.token().cancelled() => {
                warn!(host = host.address.as_str(), "transport selection cancelled");
                return Err(Cancelled.into());
            }
            shell = AnyShell::for_host(&host, &config) => shell?,
        };
        Self::new(host, shell, config, cancel)
    }
}

impl<S: RemoteShell> RemoteExecutionSession<S> {
    /// Wraps an existing transport.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::InvalidConfig`] when `config` fails
    /// validation.
    pub fn new(
        host: HostConfiguration,
        shell: S,
        config: ExecutionConfig,
        cancel: CancellationSampler,
    ) -> Result<Self, ExecutionError> {
        config.validate()?;
        Ok(Self {
            host,
            shell,
            config,
            cancel,
            connected: false,
        })
    }

    /// Target host.
    #[must_use]
    pub const fn host(&self) -> &HostConfiguration {
        &self.host
    }

    /// Underlying transport.
    #[must_use]
    pub const fn shell(&self) -> &S {
        &self.shell
    }

    /// Whether [`RemoteExecutionSession::connect`] has succeeded.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Proves the round trip by echoing a fresh random token.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Connection`] with a classified code when the
    /// transport fails or the token is not echoed back, and
    /// [`ExecutionError::Cancelled`] when cancellation is observed.
    pub async fn connect(&mut self) -> Result<(), ExecutionError> {
        let token = Uuid::new_v4().to_string();
        let probe = self.shell.dialect().probe(&token);
        match self.run_remote(&probe, Wait::Cancellable).await {
            Ok(result) if result.stdout.contains(&token) => {
                info!(host = self.host.address.as_str(), stdout = result.stdout.trim(), "connected");
                self.connected = true;
                Ok(())
            }
            Ok(result) => Err(ExecutionError::Connection {
                host: self.host.address.clone(),
                code: 0,
                message: format!(
                    "connection probe was not echoed (exit code {}): {}",
                    result.exit_code,
                    result.stderr.trim()
                ),
            }),
            Err(ExecutionError::Transport(err)) => {
                error!(host = self.host.address.as_str(), error = %err, "connection probe failed");
                Err(ExecutionError::Connection {
                    host: self.host.address.clone(),
                    code: err.connection_code(),
                    message: err.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Creates a uniquely named temporary folder and returns its path.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::TempFolder`] when the command fails or
    /// prints no path.
    pub async fn create_temp_folder(&self) -> Result<String, ExecutionError> {
        self.ensure_connected()?;
        let command = self.shell.dialect().create_temp_folder();
        let result = self.run_remote(&command, Wait::Cancellable).await?;
        let folder = result.stdout.trim_end_matches(['\r', '\n']).trim();
        if !result.is_success() {
            return Err(ExecutionError::TempFolder {
                stderr: result.stderr,
            });
        }
        if folder.is_empty() {
            return Err(ExecutionError::TempFolder {
                stderr: String::from("no folder path was printed"),
            });
        }
        Ok(folder.to_owned())
    }

    /// Uploads `script` into `folder`, one append command per chunk of at
    /// most `chunk_size` bytes. An empty script still creates the file.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Copy`] on the first failing chunk; later
    /// chunks are not sent.
    pub async fn copy(&self, folder: &str, script: &ScriptFile) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        let dialect = self.shell.dialect();
        let path = dialect.join(folder, script.name());
        let body = script.text().as_bytes();
        let chunks: Vec<&[u8]> = if body.is_empty() {
            vec![body]
        } else {
            body.chunks(self.config.chunk_size).collect()
        };
        debug!(
            file = script.name(),
            chunks = chunks.len(),
            sizes = ?chunks.iter().map(|chunk| chunk.len()).collect::<Vec<_>>(),
            "copying script"
        );
        for chunk in chunks {
            let command = dialect.append_chunk(&path, &STANDARD.encode(chunk));
            let result = self.run_remote(&command, Wait::Cancellable).await?;
            if !result.is_success() {
                return Err(ExecutionError::Copy {
                    stderr: result.stderr,
                });
            }
        }
        Ok(())
    }

    /// Runs the uploaded `script` with `env_vars` exported.
    ///
    /// When `print_output` is set, stdout and then the decoded stderr are
    /// forwarded to `sink` before the exit code is checked.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::InvalidEnvVar`] for names that are not
    /// plain identifiers and [`ExecutionError::ScriptRun`] on a non-zero
    /// exit.
    pub async fn run(
        &self,
        folder: &str,
        script: &ScriptFile,
        env_vars: &[(String, String)],
        sink: &dyn OutputSink,
        print_output: bool,
    ) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        let command = self.shell.dialect().run_script(folder, script, env_vars)?;
        let result = self.run_remote(&command, Wait::Cancellable).await?;
        if print_output {
            sink.write(&result.stdout);
            sink.write(&result.stderr);
        }
        if result.is_success() {
            Ok(())
        } else {
            Err(ExecutionError::ScriptRun {
                exit_code: result.exit_code,
                stderr: result.stderr,
            })
        }
    }

    /// Removes `folder` recursively.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::DeleteTempFolder`] when the command fails.
    pub async fn delete_temp_folder(&self, folder: &str) -> Result<(), ExecutionError> {
        self.delete_folder(folder, Wait::Cancellable).await
    }

    /// Creates a temporary folder, uploads and runs `script`, then removes
    /// the folder whatever the outcome.
    ///
    /// A failure to remove the folder is logged and never replaces the
    /// outcome of the upload or run.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while creating the folder, copying or
    /// running the script.
    pub async fn execute(
        &self,
        script: &ScriptFile,
        env_vars: &[(String, String)],
        sink: &dyn OutputSink,
        print_output: bool,
    ) -> Result<(), ExecutionError> {
        self.execute_files(script, &[], env_vars, sink, print_output)
            .await
    }

    /// Like [`RemoteExecutionSession::execute`], uploading every companion
    /// file of `bundle` next to the main script before running it.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while creating the folder, copying or
    /// running the script.
    pub async fn execute_bundle(
        &self,
        bundle: &ScriptsData,
        env_vars: &[(String, String)],
        sink: &dyn OutputSink,
        print_output: bool,
    ) -> Result<(), ExecutionError> {
        self.execute_files(
            bundle.main_script(),
            bundle.additional_files(),
            env_vars,
            sink,
            print_output,
        )
        .await
    }

    async fn execute_files(
        &self,
        script: &ScriptFile,
        companions: &[ScriptFile],
        env_vars: &[(String, String)],
        sink: &dyn OutputSink,
        print_output: bool,
    ) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        self.warn_on_unexpected_extension(script, sink);

        info!(host = self.host.address.as_str(), "creating temp folder on target machine");
        let folder = self.create_temp_folder().await?;
        info!(folder = folder.as_str(), "created temp folder");

        let outcome = self
            .upload_and_run(&folder, script, companions, env_vars, sink, print_output)
            .await;

        info!(folder = folder.as_str(), "deleting temp folder from target machine");
        if let Err(err) = self.delete_folder(&folder, Wait::ToCompletion).await {
            error!(
                folder = folder.as_str(),
                error = %err,
                "failed to delete temp folder from target machine"
            );
        }
        outcome
    }

    async fn upload_and_run(
        &self,
        folder: &str,
        script: &ScriptFile,
        companions: &[ScriptFile],
        env_vars: &[(String, String)],
        sink: &dyn OutputSink,
        print_output: bool,
    ) -> Result<(), ExecutionError> {
        for companion in companions {
            info!(file = companion.name(), folder, "copying companion file");
            self.copy(folder, companion).await?;
        }
        info!(
            file = script.name(),
            chars = script.text().chars().count(),
            folder,
            "copying script to target machine"
        );
        self.copy(folder, script).await?;
        info!(file = script.name(), "running script on target machine");
        self.run(folder, script, env_vars, sink, print_output).await?;
        info!(file = script.name(), "script finished");
        Ok(())
    }

    fn warn_on_unexpected_extension(&self, script: &ScriptFile, sink: &dyn OutputSink) {
        let dialect = self.shell.dialect();
        let extension = script.extension().unwrap_or_default();
        if dialect.expected_extensions().contains(&extension.as_str()) {
            return;
        }
        let via = match dialect {
            Dialect::PowerShell => "WinRM",
            Dialect::Posix => "SSH",
        };
        warn!(file = script.name(), via, "unexpected script extension");
        sink.write_warning(&format!(
            "Trying to run \"{}\" file via {via} on host {}",
            script.name(),
            self.host.address
        ));
    }

    async fn delete_folder(&self, folder: &str, wait: Wait) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        let command = self.shell.dialect().delete_folder(folder);
        let result = self.run_remote(&command, wait).await?;
        if result.is_success() {
            Ok(())
        } else {
            Err(ExecutionError::DeleteTempFolder {
                stderr: result.stderr,
            })
        }
    }

    const fn ensure_connected(&self) -> Result<(), ExecutionError> {
        if self.connected {
            Ok(())
        } else {
            Err(ExecutionError::NotConnected)
        }
    }

    /// Runs `command` in a fresh shell, releasing the command and shell
    /// handles on every path, and decodes CLIXML from stderr.
    async fn run_remote(
        &self,
        command: &str,
        wait: Wait,
    ) -> Result<RemoteCommandResult, ExecutionError> {
        if wait == Wait::Cancellable {
            self.cancel.throw_if_cancelled()?;
        }
        debug!(command, "running remote command");
        let shell = self.shell.open_shell().await?;
        let outcome = self.run_in_shell(&shell, command, wait).await;
        if let Err(err) = self.shell.close_shell(&shell).await {
            warn!(shell = %shell, error = %err, "failed to close remote shell");
        }
        let mut result = outcome?;
        result.stderr = decode_stderr(&result.stderr);
        debug!(
            exit_code = result.exit_code,
            stdout = result.stdout.as_str(),
            stderr = result.stderr.as_str(),
            "remote command finished"
        );
        Ok(result)
    }

    async fn run_in_shell(
        &self,
        shell: &ShellId,
        command: &str,
        wait: Wait,
    ) -> Result<RemoteCommandResult, ExecutionError> {
        let command_id = self.shell.run_command(shell, command).await?;
        let outcome = self.wait_for(shell, &command_id, wait).await;
        if let Err(err) = self.shell.cleanup_command(shell, &command_id).await {
            warn!(command_id = %command_id, error = %err, "failed to clean up remote command");
        }
        outcome
    }

    /// Waits for the command, sampling cancellation once per poll interval.
    async fn wait_for(
        &self,
        shell: &ShellId,
        command_id: &CommandId,
        wait: Wait,
    ) -> Result<RemoteCommandResult, ExecutionError> {
        let mut output = self.shell.command_output(shell, command_id);
        if wait == Wait::ToCompletion {
            return Ok(output.await?);
        }
        let mut ticks = time::interval(self.config.poll_interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                result = &mut output => return Ok(result?),
                _ = ticks.tick() => self.cancel.throw_if_cancelled()?,
            }
        }
    }
}

/// Transport chosen from [`HostConfiguration::connection`].
#[derive(Debug)]
pub enum AnyShell {
    /// WS-Management.
    WinRm(WinRmShell),
    /// System `ssh` client.
    Ssh(SshShell),
}

impl AnyShell {
    /// Builds the transport for `host`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Other`] when the WinRM HTTP client cannot
    /// be built.
    pub async fn for_host(
        host: &HostConfiguration,
        config: &ExecutionConfig,
    ) -> Result<Self, TransportError> {
        match host.connection {
            ConnectionMethod::WinRm => WinRmShell::negotiate(host, config).await.map(Self::WinRm),
            ConnectionMethod::Ssh => Ok(Self::Ssh(SshShell::new(host, config))),
        }
    }
}

impl RemoteShell for AnyShell {
    fn dialect(&self) -> Dialect {
        match self {
            Self::WinRm(shell) => shell.dialect(),
            Self::Ssh(shell) => shell.dialect(),
        }
    }

    fn open_shell(&self) -> ShellFuture<'_, ShellId> {
        match self {
            Self::WinRm(shell) => shell.open_shell(),
            Self::Ssh(shell) => shell.open_shell(),
        }
    }

    fn run_command<'a>(
        &'a self,
        shell: &'a ShellId,
        command: &'a str,
    ) -> ShellFuture<'a, CommandId> {
        match self {
            Self::WinRm(inner) => inner.run_command(shell, command),
            Self::Ssh(inner) => inner.run_command(shell, command),
        }
    }

    fn command_output<'a>(
        &'a self,
        shell: &'a ShellId,
        command: &'a CommandId,
    ) -> ShellFuture<'a, RemoteCommandResult> {
        match self {
            Self::WinRm(inner) => inner.command_output(shell, command),
            Self::Ssh(inner) => inner.command_output(shell, command),
        }
    }

    fn cleanup_command<'a>(
        &'a self,
        shell: &'a ShellId,
        command: &'a CommandId,
    ) -> ShellFuture<'a, ()> {
        match self {
            Self::WinRm(inner) => inner.cleanup_command(shell, command),
            Self::Ssh(inner) => inner.cleanup_command(shell, command),
        }
    }

    fn close_shell<'a>(&'a self, shell: &'a ShellId) -> ShellFuture<'a, ()> {
        match self {
            Self::WinRm(inner) => inner.close_shell(shell),
            Self::Ssh(inner) => inner.close_shell(shell),
        }
    }
}
