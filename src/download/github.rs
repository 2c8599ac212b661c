//! GitHub-style forge downloads through the repository contents API.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;
use url::Url;

use super::{
    DownloadConfig, DownloadError, DownloadFuture, HttpAuth, Redirects, SourceDownloader,
    build_client, decode_content, ensure_success, is_allowed_file_name, is_path_to_file,
};
use crate::cancel::CancellationSampler;
use crate::script::{ScriptFile, ScriptsData};

const KIND: &str = "GitHub";
const EXAMPLE: &str = "https://github.com/:account_id/:repo/blob/:branch/:path";

#[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
static BLOB_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https://.+?/(?P<account_id>.+?)/(?P<repo_id>.+?)/blob/(?P<branch_id>.+?)/(?P<path>.*?)$",
    )
    .expect("valid GitHub blob pattern")
});

/// Components of a GitHub blob URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GitHubUrlData {
    /// Account or organisation owning the repository.
    pub account_id: String,
    /// Repository name.
    pub repo_id: String,
    /// Branch, tag or commit.
    pub branch_id: String,
    /// Path inside the repository.
    pub path: String,
    /// Contents API URL for `path` at `branch_id`.
    pub api_url: String,
}

#[derive(Deserialize)]
struct ContentsReply {
    path: String,
    content: String,
}

/// Downloads single files from a GitHub-style forge.
#[derive(Clone, Debug)]
pub struct GitHubDownloader {
    client: Client,
    cancel: CancellationSampler,
}

impl GitHubDownloader {
    /// Creates a downloader.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Request`] when the HTTP client cannot be
    /// built.
    pub fn new(
        config: &DownloadConfig,
        cancel: CancellationSampler,
        verify_tls: bool,
    ) -> Result<Self, DownloadError> {
        Ok(Self {
            client: build_client(config, verify_tls, Redirects::Follow)?,
            cancel,
        })
    }

    /// Checks that `url` is a blob URL.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UrlFormat`] otherwise.
    pub fn validate_url(url: &str) -> Result<(), DownloadError> {
        if BLOB_URL.is_match(url) {
            Ok(())
        } else {
            Err(url_format_error(url))
        }
    }

    /// Splits a blob URL into its components and derives the API URL.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UrlFormat`] when the URL is not a blob URL.
    pub fn extract_data(url: &str) -> Result<GitHubUrlData, DownloadError> {
        let captures = BLOB_URL.captures(url).ok_or_else(|| url_format_error(url))?;
        let group = |name: &str| {
            captures
                .name(name)
                .map(|found| found.as_str().to_owned())
                .unwrap_or_default()
        };
        let parsed = Url::parse(url).map_err(|_| url_format_error(url))?;
        let authority = authority(&parsed).ok_or_else(|| url_format_error(url))?;

        let account_id = group("account_id");
        let repo_id = group("repo_id");
        let branch_id = group("branch_id");
        let path = group("path");
        let api_url = format!(
            "{}://api.{authority}/repos/{account_id}/{repo_id}/contents/{path}?ref={branch_id}",
            parsed.scheme()
        );
        Ok(GitHubUrlData {
            account_id,
            repo_id,
            branch_id,
            path,
            api_url,
        })
    }

    /// Fetches one file from the contents API.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HttpStatus`] for refused requests,
    /// [`DownloadError::UnsupportedFileType`] when the returned path is not a
    /// script, and [`DownloadError::Cancelled`] when cancellation is observed
    /// after decoding.
    pub async fn download_file(
        &self,
        api_url: &str,
        auth: &HttpAuth,
    ) -> Result<ScriptFile, DownloadError> {
        info!(api_url, "downloading file from contents API");
        let mut request = self.client.get(api_url);
        if let Some(secret) = auth.secret() {
            request = request.header("Authorization", format!("token {secret}"));
        }
        let sent = request
            .send()
            .await
            .map_err(|err| DownloadError::request(api_url, &err))?;
        info!(api_url, status = sent.status().as_u16(), "contents API replied");
        let response = ensure_success(sent, "download script file")?;
        let reply: ContentsReply = response
            .json()
            .await
            .map_err(|err| DownloadError::payload(api_url, err))?;

        let name = file_name_from_path(&reply.path);
        if !is_allowed_file_name(&name) {
            return Err(DownloadError::UnsupportedFileType { name: Some(name) });
        }
        let text = decode_content(api_url, &name, &reply.content)?;
        self.cancel.throw_if_cancelled()?;
        Ok(ScriptFile::new(name, text))
    }
}

impl SourceDownloader for GitHubDownloader {
    fn download<'a>(
        &'a self,
        url: &'a str,
        auth: &'a HttpAuth,
    ) -> DownloadFuture<'a, ScriptsData> {
        Box::pin(async move {
            let data = Self::extract_data(url)?;
            if !is_path_to_file(&data.path) {
                info!(url, "URL is not a direct file; directories are not supported");
                return Err(DownloadError::DirectoryNotSupported {
                    kind: KIND.to_owned(),
                    url: url.to_owned(),
                });
            }
            let script = self.download_file(&data.api_url, auth).await?;
            Ok(ScriptsData::single(script))
        })
    }
}

fn url_format_error(url: &str) -> DownloadError {
    DownloadError::UrlFormat {
        kind: KIND.to_owned(),
        url: url.to_owned(),
        example: EXAMPLE.to_owned(),
    }
}

/// `host[:port]` as written in the URL.
fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(url.port().map_or_else(|| host.to_owned(), |port| format!("{host}:{port}")))
}

fn file_name_from_path(path: &str) -> String {
    if path.ends_with('/') {
        return path.to_owned();
    }
    path.rsplit('/').next().unwrap_or(path).to_owned()
}
