//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::output::OutputSink;
use crate::remote::{
    CommandId, Dialect, RemoteCommandResult, RemoteShell, ShellFuture, ShellId, TransportError,
};

/// Canned reaction of [`ScriptedShell`] to one command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptedResponse {
    /// Completes with the given result.
    Complete(RemoteCommandResult),
    /// Completes successfully, echoing the command text (decoded for
    /// PowerShell) on stdout.
    Echo,
    /// Never completes.
    Hang,
    /// Fails the wait with a transport error.
    Fail(TransportError),
}

#[derive(Debug, Default)]
struct ShellState {
    responses: VecDeque<ScriptedResponse>,
    pending: HashMap<CommandId, (String, ScriptedResponse)>,
    commands: Vec<String>,
    opened: Vec<ShellId>,
    closed: Vec<ShellId>,
    cleaned: Vec<CommandId>,
    open_failure: Option<TransportError>,
    next_id: u64,
}

/// Scripted [`RemoteShell`] that answers commands from a FIFO queue.
///
/// Commands without a queued response succeed with empty output. Every
/// handle operation is recorded so tests can assert that shells and
/// commands were released.
#[derive(Clone, Debug)]
pub struct ScriptedShell {
    dialect: Dialect,
    state: Arc<Mutex<ShellState>>,
}

impl ScriptedShell {
    /// Creates a shell speaking `dialect` with no queued responses.
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: Arc::new(Mutex::new(ShellState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, ShellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues an arbitrary response.
    pub fn push(&self, response: ScriptedResponse) {
        self.state().responses.push_back(response);
    }

    /// Queues a response with the given exit code and streams.
    pub fn push_output(&self, exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) {
        self.push(ScriptedResponse::Complete(RemoteCommandResult {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Queues a successful response with empty output.
    pub fn push_success(&self) {
        self.push_output(0, "", "");
    }

    /// Makes every later `open_shell` call fail with `error`.
    pub fn fail_open_with(&self, error: TransportError) {
        self.state().open_failure = Some(error);
    }

    /// Command texts in the order they were started.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Shells opened so far.
    #[must_use]
    pub fn opened_shells(&self) -> Vec<ShellId> {
        self.state().opened.clone()
    }

    /// Shells closed so far.
    #[must_use]
    pub fn closed_shells(&self) -> Vec<ShellId> {
        self.state().closed.clone()
    }

    /// Commands cleaned up so far.
    #[must_use]
    pub fn cleaned_commands(&self) -> Vec<CommandId> {
        self.state().cleaned.clone()
    }

    /// Number of started commands whose handles were not cleaned up.
    #[must_use]
    pub fn leaked_commands(&self) -> usize {
        self.state().pending.len()
    }

    fn visible_text(&self, command: &str) -> String {
        match self.dialect {
            Dialect::PowerShell => {
                decode_powershell_command(command).unwrap_or_else(|| command.to_owned())
            }
            Dialect::Posix => command.to_owned(),
        }
    }
}

impl RemoteShell for ScriptedShell {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn open_shell(&self) -> ShellFuture<'_, ShellId> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(error) = state.open_failure.clone() {
                return Err(error);
            }
            state.next_id += 1;
            let id = ShellId::new(format!("shell-{}", state.next_id));
            state.opened.push(id.clone());
            Ok(id)
        })
    }

    fn run_command<'a>(
        &'a self,
        _shell: &'a ShellId,
        command: &'a str,
    ) -> ShellFuture<'a, CommandId> {
        Box::pin(async move {
            let mut state = self.state();
            state.next_id += 1;
            let id = CommandId::new(format!("command-{}", state.next_id));
            let response = state
                .responses
                .pop_front()
                .unwrap_or_else(|| ScriptedResponse::Complete(RemoteCommandResult::default()));
            state.commands.push(command.to_owned());
            state
                .pending
                .insert(id.clone(), (command.to_owned(), response));
            Ok(id)
        })
    }

    fn command_output<'a>(
        &'a self,
        _shell: &'a ShellId,
        command: &'a CommandId,
    ) -> ShellFuture<'a, RemoteCommandResult> {
        Box::pin(async move {
            let pending = self.state().pending.get(command).cloned();
            match pending {
                Some((_, ScriptedResponse::Complete(result))) => Ok(result),
                Some((text, ScriptedResponse::Echo)) => Ok(RemoteCommandResult {
                    exit_code: 0,
                    stdout: format!("{}\r\n", self.visible_text(&text)),
                    stderr: String::new(),
                }),
                Some((_, ScriptedResponse::Fail(error))) => Err(error),
                Some((_, ScriptedResponse::Hang)) => std::future::pending().await,
                None => Err(TransportError::Other {
                    message: format!("unknown command {command}"),
                }),
            }
        })
    }

    fn cleanup_command<'a>(
        &'a self,
        _shell: &'a ShellId,
        command: &'a CommandId,
    ) -> ShellFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state();
            state.pending.remove(command);
            state.cleaned.push(command.clone());
            Ok(())
        })
    }

    fn close_shell<'a>(&'a self, shell: &'a ShellId) -> ShellFuture<'a, ()> {
        Box::pin(async move {
            self.state().closed.push(shell.clone());
            Ok(())
        })
    }
}

/// Recovers the script from a `powershell ... -EncodedCommand <base64>`
/// command line.
#[must_use]
#[expect(
    clippy::little_endian_bytes,
    reason = "PowerShell -EncodedCommand is defined over UTF-16LE"
)]
pub fn decode_powershell_command(command: &str) -> Option<String> {
    let (_, encoded) = command.rsplit_once(' ')?;
    let bytes = STANDARD.decode(encoded).ok()?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .filter_map(|pair| <[u8; 2]>::try_from(pair).ok())
        .map(u16::from_le_bytes)
        .collect();
    String::from_utf16(&units).ok()
}

/// [`OutputSink`] that records everything written to it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    outputs: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages passed to [`OutputSink::write`].
    #[must_use]
    pub fn outputs(&self) -> Vec<String> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages passed to [`OutputSink::write_warning`].
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputSink for RecordingSink {
    fn write(&self, text: &str) {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_owned());
    }

    fn write_warning(&self, text: &str) {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_owned());
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Guard that holds [`ENV_LOCK`] and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: tokio::sync::MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets every `(key, value)` pair while holding [`ENV_LOCK`].
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
