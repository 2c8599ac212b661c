//! Execution settings loaded via `ortho-config`.
//!
//! [`ExecutionConfig`] merges defaults, configuration files and
//! environment variables (prefix `SCRIPTFERRY_EXEC`).

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default upper bound, in bytes, of one uploaded chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 2000;

/// Remote execution and transport settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SCRIPTFERRY_EXEC",
    discovery(
        app_name = "scriptferry",
        env_var = "SCRIPTFERRY_CONFIG_PATH",
        config_file_name = "scriptferry.toml",
        dotfile_name = ".scriptferry.toml",
        project_file_name = "scriptferry.toml"
    )
)]
pub struct ExecutionConfig {
    /// Raw bytes per copy command, before base64 expansion.
    #[ortho_config(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
    /// Interval between cancellation checks while a command runs.
    #[ortho_config(default = 1000)]
    pub poll_interval_ms: u64,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// WinRM HTTP port.
    #[ortho_config(default = 5985)]
    pub winrm_http_port: u16,
    /// WinRM HTTPS port.
    #[ortho_config(default = 5986)]
    pub winrm_https_port: u16,
    /// WS-Man `OperationTimeout` for receive calls, in seconds.
    #[ortho_config(default = 20)]
    pub winrm_operation_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval_ms: 1000,
            ssh_bin: String::from("ssh"),
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            winrm_http_port: 5985,
            winrm_https_port: 5986,
            winrm_operation_timeout_secs: 20,
        }
    }
}

/// Errors raised when loading or validating [`ExecutionConfig`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecutionConfigError {
    /// Raised when a field holds an unusable value.
    #[error("invalid {field}: set SCRIPTFERRY_EXEC_{env_suffix} or add {field} to scriptferry.toml", env_suffix = field.to_uppercase())]
    InvalidField {
        /// Field that failed validation.
        field: String,
    },
    /// Raised when merging configuration layers fails.
    #[error("execution configuration parsing failed: {0}")]
    Parse(String),
}

impl ExecutionConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// WS-Man operation timeout as a [`Duration`].
    #[must_use]
    pub const fn winrm_operation_timeout(&self) -> Duration {
        Duration::from_secs(self.winrm_operation_timeout_secs)
    }

    /// Ensures sizes and intervals are positive and binaries are named.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionConfigError::InvalidField`] naming the first bad
    /// field.
    pub fn validate(&self) -> Result<(), ExecutionConfigError> {
        let checks = [
            (self.chunk_size == 0, "chunk_size"),
            (self.poll_interval_ms == 0, "poll_interval_ms"),
            (self.ssh_bin.trim().is_empty(), "ssh_bin"),
            (self.winrm_http_port == 0, "winrm_http_port"),
            (self.winrm_https_port == 0, "winrm_https_port"),
            (self.winrm_operation_timeout_secs == 0, "winrm_operation_timeout_secs"),
        ];
        match checks.into_iter().find(|(failed, _)| *failed) {
            Some((_, field)) => Err(ExecutionConfigError::InvalidField {
                field: field.to_owned(),
            }),
            None => Ok(()),
        }
    }

    /// Loads configuration from defaults, files and environment variables,
    /// ignoring the process command line.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ExecutionConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("scriptferry")])
            .map_err(|err| ExecutionConfigError::Parse(err.to_string()))
    }

    /// Loads configuration using the default argument iterator.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionConfigError::Parse`] when merging sources fails.
    pub fn load_from_sources() -> Result<Self, ExecutionConfigError> {
        Self::load().map_err(|err| ExecutionConfigError::Parse(err.to_string()))
    }
}
