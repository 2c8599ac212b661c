//! Download settings loaded via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default user agent sent with every request; forge APIs reject anonymous
/// clients without one.
pub const DEFAULT_USER_AGENT: &str = concat!("scriptferry/", env!("CARGO_PKG_VERSION"));

/// HTTP settings for script acquisition.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SCRIPTFERRY_DOWNLOAD",
    discovery(
        app_name = "scriptferry",
        env_var = "SCRIPTFERRY_CONFIG_PATH",
        config_file_name = "scriptferry.toml",
        dotfile_name = ".scriptferry.toml",
        project_file_name = "scriptferry.toml"
    )
)]
pub struct DownloadConfig {
    /// Whether server certificates are verified. When `false`, verification
    /// is off for every download regardless of the per-call flag.
    #[ortho_config(default = true)]
    pub verify_tls: bool,
    /// Per-request timeout in seconds.
    #[ortho_config(default = 30)]
    pub http_timeout_secs: u64,
    /// Upper bound on redirects followed manually for bearer-token requests.
    #[ortho_config(default = 10)]
    pub max_redirects: u32,
    /// User agent header value.
    #[ortho_config(default = DEFAULT_USER_AGENT.to_owned())]
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            verify_tls: true,
            http_timeout_secs: 30,
            max_redirects: 10,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

/// Errors raised when loading or validating [`DownloadConfig`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DownloadConfigError {
    /// Raised when a field holds an unusable value.
    #[error("invalid {field}: set SCRIPTFERRY_DOWNLOAD_{env_suffix} or add {field} to [download] in scriptferry.toml", env_suffix = field.to_uppercase())]
    InvalidField {
        /// Field that failed validation.
        field: String,
    },
    /// Raised when merging configuration layers fails.
    #[error("download configuration parsing failed: {0}")]
    Parse(String),
}

impl DownloadConfig {
    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Ensures numeric limits are positive and the user agent is present.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadConfigError::InvalidField`] naming the first bad
    /// field.
    pub fn validate(&self) -> Result<(), DownloadConfigError> {
        if self.http_timeout_secs == 0 {
            return Err(Self::invalid("http_timeout_secs"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(Self::invalid("user_agent"));
        }
        Ok(())
    }

    /// Loads configuration from defaults, files and environment variables,
    /// ignoring the process command line.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, DownloadConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("scriptferry")])
            .map_err(|err| DownloadConfigError::Parse(err.to_string()))
    }

    /// Loads configuration using the default argument iterator.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadConfigError::Parse`] when merging sources fails.
    pub fn load_from_sources() -> Result<Self, DownloadConfigError> {
        Self::load().map_err(|err| DownloadConfigError::Parse(err.to_string()))
    }

    fn invalid(field: &str) -> DownloadConfigError {
        DownloadConfigError::InvalidField {
            field: field.to_owned(),
        }
    }
}
