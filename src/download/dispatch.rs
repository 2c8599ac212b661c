//! Source selection and the ordered authentication chain.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use super::{
    DownloadConfig, DownloadError, GenericHttpDownloader, GitHubDownloader, GitLabDownloader,
    HttpAuth, SourceDownloader,
};
use crate::cancel::CancellationSampler;
use crate::script::ScriptsData;

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static GITLAB_API_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?P<protocol>https?)://(?P<domain>[^/]+)/api/v4/projects/(?P<project>.+)/repository/files/(?P<file>[^?#]+(?:\.|%2E)(?:sh|bash|ps1))(?:[^?#]*\?(?:[^#]*&)?ref=(?P<branch>[^&#]+))?",
    )
    .expect("valid GitLab API pattern")
});

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static GITLAB_WEB_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?P<protocol>https?)://(?P<domain>[^/]+)/(?P<project>.+)/-/(?:blob|raw)/(?P<branch>[^/]+)/(?P<file>[^?#]+\.(?:sh|bash|ps1))",
    )
    .expect("valid GitLab web pattern")
});

/// One attempt in the generic authentication chain.
#[derive(Clone, Eq, PartialEq)]
pub enum AuthStrategy {
    /// GitLab raw-file API call with a `Private-Token` header.
    GitLabPrivateToken {
        /// Raw-file API URL derived from the caller's URL.
        api_url: String,
        /// Personal or project access token.
        token: String,
    },
    /// Original URL with `Authorization: Bearer`, following redirects by hand
    /// so the header survives host changes.
    Bearer {
        /// Bearer token.
        token: String,
    },
    /// HTTP basic authentication.
    Basic {
        /// Account name.
        username: String,
        /// Account password, possibly empty.
        password: String,
    },
    /// No credentials.
    Anonymous,
}

impl AuthStrategy {
    /// Short label used in log events and errors.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::GitLabPrivateToken { .. } => "private-token",
            Self::Bearer { .. } => "bearer",
            Self::Basic { .. } => "basic",
            Self::Anonymous => "anonymous",
        }
    }
}

impl fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitLabPrivateToken { api_url, .. } => f
                .debug_struct("GitLabPrivateToken")
                .field("api_url", api_url)
                .finish_non_exhaustive(),
            Self::Bearer { .. } => f.debug_struct("Bearer").finish_non_exhaustive(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Rewrites a GitLab API or web file URL into the raw-file API form.
///
/// Returns `None` when the URL is not recognisably GitLab. Slashes and dots
/// in the project and file path are percent-encoded as the API requires.
///
/// ```
/// use scriptferry::download::gitlab_raw_api_url;
///
/// let api = gitlab_raw_api_url("http://10.0.0.5/root/tools/-/blob/main/ci/run.sh");
/// assert_eq!(
///     api.as_deref(),
///     Some("http://10.0.0.5/api/v4/projects/root%2Ftools/repository/files/ci%2Frun%2Esh/raw?ref=main")
/// );
/// ```
#[must_use]
pub fn gitlab_raw_api_url(url: &str) -> Option<String> {
    let pattern: &Regex = if url.contains("api/v4/projects") {
        &GITLAB_API_FILE
    } else {
        &GITLAB_WEB_FILE
    };
    let captures = pattern.captures(url)?;
    let protocol = captures.name("protocol")?.as_str();
    let domain = captures.name("domain")?.as_str();
    let project = encode_path(captures.name("project")?.as_str());
    let file = encode_path(captures.name("file")?.as_str());
    let mut api_url =
        format!("{protocol}://{domain}/api/v4/projects/{project}/repository/files/{file}/raw");
    if let Some(branch) = captures.name("branch") {
        api_url.push_str("?ref=");
        api_url.push_str(branch.as_str());
    }
    Some(api_url)
}

fn encode_path(raw: &str) -> String {
    raw.replace('/', "%2F").replace('.', "%2E")
}

/// Orders the strategies the generic downloader attempts for `url`.
///
/// A token yields the GitLab raw probe (when the URL converts) followed by a
/// bearer request. Otherwise a username yields basic authentication, and
/// with neither the request is anonymous.
#[must_use]
pub fn authentication_plan(url: &str, auth: &HttpAuth) -> Vec<AuthStrategy> {
    if let Some(token) = auth.token() {
        let mut plan = Vec::with_capacity(2);
        if let Some(api_url) = gitlab_raw_api_url(url) {
            plan.push(AuthStrategy::GitLabPrivateToken {
                api_url,
                token: token.to_owned(),
            });
        }
        plan.push(AuthStrategy::Bearer {
            token: token.to_owned(),
        });
        return plan;
    }
    if let Some(username) = auth.username() {
        return vec![AuthStrategy::Basic {
            username: username.to_owned(),
            password: auth.password().unwrap_or_default().to_owned(),
        }];
    }
    vec![AuthStrategy::Anonymous]
}

/// Which downloader a URL and credential pair routes to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Route {
    GitHub,
    GitLab,
    Generic,
}

pub(crate) fn route(url: &str, auth: &HttpAuth) -> Route {
    if auth.secret().is_none() {
        return Route::Generic;
    }
    let path = url.split('?').next().unwrap_or_default();
    if GitLabDownloader::validate_url(url).is_ok() {
        return if is_raw_endpoint(path) {
            Route::Generic
        } else {
            Route::GitLab
        };
    }
    // GitLab web URLs (`/-/blob/`) also satisfy the GitHub shape.
    if path.contains("/-/") {
        return Route::Generic;
    }
    if GitHubDownloader::validate_url(url).is_ok() {
        return Route::GitHub;
    }
    Route::Generic
}

fn is_raw_endpoint(path: &str) -> bool {
    path.trim_end_matches('/').ends_with("/raw")
}

/// Entry point of the acquisition layer.
///
/// The dispatcher owns the configuration and cancellation token and builds a
/// fresh downloader per call, so concurrent downloads share no mutable
/// state.
#[derive(Clone, Debug)]
pub struct DownloadDispatcher {
    config: DownloadConfig,
    cancel: CancellationSampler,
}

impl DownloadDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub const fn new(config: DownloadConfig, cancel: CancellationSampler) -> Self {
        Self { config, cancel }
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Downloads the script behind `url`.
    ///
    /// # Errors
    ///
    /// Propagates the selected downloader's [`DownloadError`]; cancellation
    /// surfaces as [`DownloadError::Cancelled`].
    pub async fn download(
        &self,
        url: &str,
        auth: &HttpAuth,
        verify_tls: bool,
    ) -> Result<ScriptsData, DownloadError> {
        self.cancel.throw_if_cancelled()?;
        let verify = verify_tls && self.config.verify_tls;
        debug!(url, verify_tls = verify, username = auth.username(), "starting script download");
        if !verify {
            info!("skipping server certificate verification");
        }

        let selected = route(url, auth);
        info!(url, source = ?selected, "selected script source");
        match selected {
            Route::GitHub => {
                let downloader =
                    GitHubDownloader::new(&self.config, self.cancel.clone(), verify)?;
                downloader.download(url, auth).await
            }
            Route::GitLab => {
                let downloader =
                    GitLabDownloader::new(&self.config, self.cancel.clone(), verify)?;
                downloader.download(url, auth).await
            }
            Route::Generic => {
                let downloader =
                    GenericHttpDownloader::new(&self.config, self.cancel.clone(), verify)?;
                downloader.download(url, auth).await
            }
        }
    }
}
