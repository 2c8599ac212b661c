//! Shared fixtures for execution session tests.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use scriptferry::remote::{Dialect, ExecutionConfig, RemoteExecutionSession};
use scriptferry::test_support::{ScriptedResponse, ScriptedShell, decode_powershell_command};
use scriptferry::{CancellationSampler, HostConfiguration};

static POWERSHELL_CHUNK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"FromBase64String\('([^']*)'\)").expect("valid chunk pattern")
});

pub const TEMP_FOLDER: &str = "/tmp/tmp.sf42";

pub fn host() -> HostConfiguration {
    HostConfiguration::builder()
        .address("10.20.30.40")
        .username("operator")
        .password("hunter2")
        .build()
        .expect("valid host")
}

pub fn config(chunk_size: usize) -> ExecutionConfig {
    ExecutionConfig {
        chunk_size,
        poll_interval_ms: 50,
        ..ExecutionConfig::default()
    }
}

/// Builds a session over `shell` and runs its connection probe.
pub async fn connected_session(
    shell: &ScriptedShell,
    chunk_size: usize,
    cancel: CancellationSampler,
) -> RemoteExecutionSession<ScriptedShell> {
    shell.push(ScriptedResponse::Echo);
    let mut session = RemoteExecutionSession::new(host(), shell.clone(), config(chunk_size), cancel)
        .expect("valid config");
    session.connect().await.expect("probe should be echoed");
    session
}

/// Decodes the payload of one append command.
pub fn chunk_payload(dialect: Dialect, command: &str) -> Option<Vec<u8>> {
    let encoded = match dialect {
        Dialect::Posix => {
            let rest = command.strip_prefix("printf '%s' ")?;
            let (token, _) = rest.split_once(" | base64 -d >> ")?;
            token.trim_matches('\'').to_owned()
        }
        Dialect::PowerShell => {
            let script = decode_powershell_command(command)?;
            POWERSHELL_CHUNK
                .captures(&script)?
                .get(1)?
                .as_str()
                .to_owned()
        }
    };
    STANDARD.decode(encoded).ok()
}

/// Concatenates the payloads of every append command, in issue order.
pub fn uploaded_bytes(dialect: Dialect, commands: &[String]) -> Vec<u8> {
    commands
        .iter()
        .filter_map(|command| chunk_payload(dialect, command))
        .flatten()
        .collect()
}
