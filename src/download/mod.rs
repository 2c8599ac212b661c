//! Script acquisition from generic HTTP servers and Git forges.
//!
//! A [`DownloadDispatcher`] inspects the URL and credentials, then hands the
//! request to one [`SourceDownloader`]: the GitHub-style and GitLab-style
//! downloaders translate web URLs into content API calls, while the generic
//! downloader walks an ordered authentication chain against the raw URL.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use reqwest::redirect::Policy;

use crate::script::ScriptsData;

mod config;
mod dispatch;
mod error;
mod filename;
mod generic;
mod github;
mod gitlab;

pub use config::{DEFAULT_USER_AGENT, DownloadConfig, DownloadConfigError};
pub use dispatch::{AuthStrategy, DownloadDispatcher, authentication_plan, gitlab_raw_api_url};
pub use error::DownloadError;
pub use generic::GenericHttpDownloader;
pub use github::{GitHubDownloader, GitHubUrlData};
pub use gitlab::{GitLabDownloader, GitLabUrlData, TreeEntry};

/// Pattern every downloadable script name must match.
pub const ALLOWED_FILE_PATTERN: &str = r"(?i)^\s*[^/\\]*[^/\\\s]\.(sh|bash|ps1)\s*$";

#[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
static ALLOWED_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(ALLOWED_FILE_PATTERN).expect("valid allowed-file pattern"));

/// Returns `true` when `name` carries one of the supported extensions.
#[must_use]
pub fn is_allowed_file_name(name: &str) -> bool {
    ALLOWED_FILE.is_match(name)
}

/// Returns `true` when the final segment of `path` names a supported script.
#[must_use]
pub fn is_path_to_file(path: &str) -> bool {
    path.rsplit('/').next().is_some_and(is_allowed_file_name)
}

/// Credentials supplied alongside a script URL.
///
/// Blank fields are normalised to `None` so each strategy can fall through
/// to the next weaker one.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct HttpAuth {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

impl HttpAuth {
    /// Builds credentials, discarding blank values.
    #[must_use]
    pub fn new(
        username: Option<String>,
        password: Option<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            username: non_blank(username),
            password: non_blank(password),
            token: non_blank(token),
        }
    }

    /// Credentials that authenticate nothing.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Username for basic authentication.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Password for basic authentication.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// API or bearer token.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Secret used by forge APIs: the token when present, else the password.
    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        self.token().or_else(|| self.password())
    }

    /// Returns `true` when no credential of any kind was supplied.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        self.username.is_none() && self.password.is_none() && self.token.is_none()
    }
}

impl fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

/// Future returned by source downloaders.
pub type DownloadFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DownloadError>> + Send + 'a>>;

/// A script source able to turn a URL into script payloads.
pub trait SourceDownloader {
    /// Fetches the script (and any companions) behind `url`.
    fn download<'a>(&'a self, url: &'a str, auth: &'a HttpAuth)
    -> DownloadFuture<'a, ScriptsData>;
}

/// How a client treats redirect responses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Redirects {
    Follow,
    Manual,
}

pub(crate) fn build_client(
    config: &DownloadConfig,
    verify_tls: bool,
    redirects: Redirects,
) -> Result<reqwest::Client, DownloadError> {
    let policy = match redirects {
        Redirects::Follow => Policy::limited(config.max_redirects as usize),
        Redirects::Manual => Policy::none(),
    };
    reqwest::Client::builder()
        .timeout(config.http_timeout())
        .user_agent(config.user_agent.as_str())
        .danger_accept_invalid_certs(!verify_tls)
        .redirect(policy)
        .build()
        .map_err(|err| DownloadError::Request {
            url: String::new(),
            message: format!("failed to build HTTP client: {err}"),
        })
}

/// Fails with [`DownloadError::HttpStatus`] unless the status is 2xx.
pub(crate) fn ensure_success(
    response: reqwest::Response,
    action: &str,
) -> Result<reqwest::Response, DownloadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(DownloadError::HttpStatus {
        action: action.to_owned(),
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or_default().to_owned(),
        url: response.url().to_string(),
    })
}

/// Decodes a forge `content` field. Forges wrap base64 at fixed widths, so
/// whitespace is dropped before decoding.
pub(crate) fn decode_content(
    url: &str,
    name: &str,
    encoded: &str,
) -> Result<String, DownloadError> {
    let compact: String = encoded
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| DownloadError::payload(url, err))?;
    String::from_utf8(bytes).map_err(|_| DownloadError::InvalidEncoding {
        name: name.to_owned(),
    })
}

#[cfg(test)]
mod tests;
