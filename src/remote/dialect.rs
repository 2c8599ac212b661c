//! Command templating for the shells a target understands.
//!
//! Every value interpolated into a remote command goes through the
//! dialect's quoting: PowerShell literals are single-quoted with embedded
//! quotes doubled, POSIX literals are escaped with `shell-escape`. Variable
//! names cannot be quoted, so they are validated instead.

use std::borrow::Cow;
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;

use super::ExecutionError;
use crate::script::ScriptFile;

#[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid env name pattern"));

/// Ends a PowerShell run with the script's outcome. `$?` is captured
/// before the `if` resets it.
const POWERSHELL_EXIT: &str = "$succeeded = $?\n\
     if ($LASTEXITCODE) { exit $LASTEXITCODE } elseif (-not $succeeded) { exit 1 } else { exit 0 }";

/// Command language spoken by the remote shell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dialect {
    /// Windows PowerShell launched from `cmd.exe`.
    PowerShell,
    /// A POSIX `sh`-compatible shell.
    Posix,
}

impl Dialect {
    /// Script extensions this dialect runs natively, lower-case without dot.
    #[must_use]
    pub const fn expected_extensions(self) -> &'static [&'static str] {
        match self {
            Self::PowerShell => &["ps1"],
            Self::Posix => &["sh", "bash"],
        }
    }

    /// Quotes `value` as a literal string.
    #[must_use]
    pub fn quote(self, value: &str) -> String {
        match self {
            Self::PowerShell => format!("'{}'", value.replace('\'', "''")),
            Self::Posix => shell_escape::unix::escape(Cow::Borrowed(value)).into_owned(),
        }
    }

    /// Path of `name` inside `folder` on the target.
    #[must_use]
    pub fn join(self, folder: &str, name: &str) -> String {
        match self {
            Self::PowerShell => format!("{}\\{name}", folder.trim_end_matches('\\')),
            Self::Posix => format!("{}/{name}", folder.trim_end_matches('/')),
        }
    }

    /// Echo probe used to prove the round trip works.
    #[must_use]
    pub fn probe(self, token: &str) -> String {
        match self {
            Self::PowerShell => self.wrap(&format!("Write-Output {}", self.quote(token))),
            Self::Posix => format!("echo {}", self.quote(token)),
        }
    }

    /// Creates a uniquely named temporary directory and prints its path.
    #[must_use]
    pub fn create_temp_folder(self) -> String {
        match self {
            Self::PowerShell => self.wrap(concat!(
                "$fullPath = Join-Path $env:TEMP ([System.Guid]::NewGuid().ToString())\n",
                "New-Item -ItemType Directory -Path $fullPath | Out-Null\n",
                "Write-Output $fullPath"
            )),
            Self::Posix => String::from("mktemp -d"),
        }
    }

    /// Appends the bytes of one base64 chunk to `path`, creating the file
    /// when absent.
    #[must_use]
    pub fn append_chunk(self, path: &str, encoded_chunk: &str) -> String {
        match self {
            Self::PowerShell => self.wrap(&format!(
                "$data = [System.Convert]::FromBase64String({chunk})\n\
                 $stream = [System.IO.File]::Open({path}, 'Append')\n\
                 try {{ $stream.Write($data, 0, $data.Length) }} finally {{ $stream.Close() }}",
                chunk = self.quote(encoded_chunk),
                path = self.quote(path),
            )),
            Self::Posix => format!(
                "printf '%s' {} | base64 -d >> {}",
                self.quote(encoded_chunk),
                self.quote(path)
            ),
        }
    }

    /// Exports `env_vars` and runs `script`, uploaded into `folder`, from
    /// that folder.
    ///
    /// PowerShell exits with the script's native exit code, or 1 when the
    /// script's last statement failed without setting one. POSIX scripts run
    /// under the interpreter of their `#!` line, falling back to `bash` for
    /// `.bash` files and `sh` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::InvalidEnvVar`] when a name is not a plain
    /// identifier.
    pub fn run_script(
        self,
        folder: &str,
        script: &ScriptFile,
        env_vars: &[(String, String)],
    ) -> Result<String, ExecutionError> {
        let path = self.join(folder, script.name());
        for (name, _) in env_vars {
            validate_env_name(name)?;
        }
        Ok(match self {
            Self::PowerShell => {
                let mut command = String::new();
                for (name, value) in env_vars {
                    command.push_str(&format!("$env:{name} = {}\n", self.quote(value)));
                }
                command.push_str(&format!(
                    "Set-Location -LiteralPath {}\n& {}\n{POWERSHELL_EXIT}",
                    self.quote(folder),
                    self.quote(&path)
                ));
                self.wrap(&command)
            }
            Self::Posix => {
                let mut parts = vec![format!("cd {}", self.quote(folder))];
                parts.extend(
                    env_vars
                        .iter()
                        .map(|(name, value)| format!("export {name}={}", self.quote(value))),
                );
                let mut invocation = match script.shebang() {
                    Some(words) => words
                        .into_iter()
                        .map(|word| self.quote(word))
                        .collect::<Vec<_>>(),
                    None if script.extension().as_deref() == Some("bash") => {
                        vec![String::from("bash")]
                    }
                    None => vec![String::from("sh")],
                };
                invocation.push(self.quote(&path));
                parts.push(invocation.join(" "));
                parts.join(" && ")
            }
        })
    }

    /// Recursively removes `folder`.
    #[must_use]
    pub fn delete_folder(self, folder: &str) -> String {
        match self {
            Self::PowerShell => self.wrap(&format!(
                "Remove-Item -LiteralPath {} -Recurse -Force",
                self.quote(folder)
            )),
            Self::Posix => format!("rm -rf {}", self.quote(folder)),
        }
    }

    /// Turns a script into the command line handed to the transport.
    fn wrap(self, script: &str) -> String {
        match self {
            Self::PowerShell => format!(
                "powershell -NoProfile -NonInteractive -EncodedCommand {}",
                encode_powershell(script)
            ),
            Self::Posix => script.to_owned(),
        }
    }
}

/// Base64 of the UTF-16LE encoding of `script`, as `-EncodedCommand` expects.
#[must_use]
#[expect(
    clippy::little_endian_bytes,
    reason = "PowerShell -EncodedCommand is defined over UTF-16LE"
)]
pub fn encode_powershell(script: &str) -> String {
    let mut bytes = Vec::with_capacity(script.len() * 2);
    for unit in script.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

fn validate_env_name(name: &str) -> Result<(), ExecutionError> {
    if ENV_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ExecutionError::InvalidEnvVar {
            name: name.to_owned(),
        })
    }
}
