//! GitLab-style forge downloads through the repository files and tree APIs.
//!
//! A URL whose file path names a script downloads that single file. Any
//! other path is treated as a directory: the tree is listed, junk entries
//! are dropped, `main.{sh,bash,ps1}` becomes the entry point and every other
//! blob is fetched as a companion file.

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

const KIND: &str = "GitLab";
const EXAMPLE: &str = "https://*/api/v4/projects/:id/repository/files/:file_path?ref=master";
const DEFAULT_REF: &str = "master";
const PAGE_SIZE: u32 = 100;

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static FILES_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https?://.+?/api/v4/projects/(?P<project_id>.+?)/repository/files/(?P<file_path>.*?)$",
    )
    .expect("valid GitLab files pattern")
});

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static MAIN_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^main\.(sh|bash|ps1)$").expect("valid main file pattern"));

/// Components of a GitLab files API URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GitLabUrlData {
    /// Numeric or URL-encoded project identifier.
    pub project_id: String,
    /// File or directory path, empty for the repository root.
    pub file_path: String,
    /// `ref` query parameter, if supplied.
    pub ref_name: Option<String>,
    /// Scheme, host and port of the instance.
    pub base_url: String,
}

/// One entry of a repository tree listing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct TreeEntry {
    /// Entry name without directories.
    pub name: String,
    /// `blob` for files, `tree` for directories.
    #[serde(rename = "type")]
    pub kind: String,
    /// Path relative to the repository root.
    pub path: String,
}

impl TreeEntry {
    /// Creates a listing entry.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            path: path.into(),
        }
    }

    fn is_junk(&self) -> bool {
        self.kind != "blob" || self.name.starts_with('.') || self.name == "README.md"
    }
}

#[derive(Deserialize)]
struct FileReply {
    file_name: String,
    content: String,
}

/// Downloads single files or whole directories from a GitLab-style forge.
#[derive(Clone, Debug)]
pub struct GitLabDownloader {
    client: Client,
    cancel: CancellationSampler,
}

impl GitLabDownloader {
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

    /// Checks that `url` targets the repository files API.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UrlFormat`] otherwise.
    pub fn validate_url(url: &str) -> Result<(), DownloadError> {
        if FILES_URL.is_match(url) {
            Ok(())
        } else {
            Err(url_format_error(url))
        }
    }

    /// Splits a files API URL into project, path, ref and instance base.
    ///
    /// Query parameters other than `ref` are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UrlFormat`] when the URL does not match.
    pub fn extract_data(url: &str) -> Result<GitLabUrlData, DownloadError> {
        let captures = FILES_URL.captures(url).ok_or_else(|| url_format_error(url))?;
        let project_id = captures
            .name("project_id")
            .map(|found| found.as_str().to_owned())
            .unwrap_or_default();
        let file_path = captures
            .name("file_path")
            .and_then(|found| found.as_str().split('?').next())
            .unwrap_or_default()
            .to_owned();
        let parsed = Url::parse(url).map_err(|_| url_format_error(url))?;
        let ref_name = parsed
            .query_pairs()
            .find(|(key, _)| key == "ref")
            .map(|(_, value)| value.into_owned());
        Ok(GitLabUrlData {
            project_id,
            file_path,
            ref_name,
            base_url: parsed.origin().ascii_serialization(),
        })
    }

    /// Tree listing URL for the directory named by `data`.
    #[must_use]
    pub fn tree_url(data: &GitLabUrlData) -> String {
        let mut url = format!(
            "{}/api/v4/projects/{}/repository/tree?per_page={PAGE_SIZE}",
            data.base_url, data.project_id
        );
        if let Some(ref_name) = &data.ref_name {
            url.push_str("&ref=");
            url.push_str(&urlencoding::encode(ref_name));
        }
        if !data.file_path.is_empty() {
            let path = urlencoding::decode(&data.file_path)
                .map_or_else(|_| data.file_path.clone(), |decoded| decoded.into_owned());
            url.push_str("&path=");
            url.push_str(&urlencoding::encode(&path));
        }
        url
    }

    /// Files API URL for one listing entry, defaulting the ref to `master`.
    #[must_use]
    pub fn file_url(data: &GitLabUrlData, entry: &TreeEntry) -> String {
        format!(
            "{}/api/v4/projects/{}/repository/files/{}?ref={}",
            data.base_url,
            data.project_id,
            urlencoding::encode(&entry.path),
            urlencoding::encode(data.ref_name.as_deref().unwrap_or(DEFAULT_REF)),
        )
    }

    /// Drops directories, dotfiles and `README.md`, preserving order.
    #[must_use]
    pub fn remove_junk(entries: Vec<TreeEntry>) -> Vec<TreeEntry> {
        entries.into_iter().filter(|entry| !entry.is_junk()).collect()
    }

    /// First entry named `main.sh`, `main.bash` or `main.ps1`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::MainFileNotFound`] when no entry qualifies.
    pub fn main_file<'e>(
        entries: &'e [TreeEntry],
        path: &str,
    ) -> Result<&'e TreeEntry, DownloadError> {
        entries
            .iter()
            .find(|entry| MAIN_FILE.is_match(&entry.name))
            .ok_or_else(|| DownloadError::MainFileNotFound {
                path: path.to_owned(),
            })
    }

    /// Lists the directory named by `data`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HttpStatus`] for refused requests,
    /// [`DownloadError::InvalidPayload`] for undecodable listings and
    /// [`DownloadError::Cancelled`] when cancellation is observed afterwards.
    pub async fn list_directory(
        &self,
        data: &GitLabUrlData,
        auth: &HttpAuth,
    ) -> Result<Vec<TreeEntry>, DownloadError> {
        let url = Self::tree_url(data);
        info!(url, "requesting directory listing");
        let sent = self
            .authorised(&url, auth)
            .send()
            .await
            .map_err(|err| DownloadError::request(&url, &err))?;
        let response = ensure_success(sent, "list files in path")?;
        let entries: Vec<TreeEntry> = response
            .json()
            .await
            .map_err(|err| DownloadError::payload(&url, err))?;
        self.cancel.throw_if_cancelled()?;
        Ok(entries)
    }

    /// Fetches one file through the files API.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HttpStatus`] for refused requests,
    /// [`DownloadError::UnsupportedFileType`] when the file is not a script,
    /// [`DownloadError::InvalidEncoding`] for non-UTF-8 content and
    /// [`DownloadError::Cancelled`] when cancellation is observed after
    /// decoding.
    pub async fn download_file(
        &self,
        file_url: &str,
        auth: &HttpAuth,
    ) -> Result<ScriptFile, DownloadError> {
        info!(url = file_url, "downloading file");
        let sent = self
            .authorised(file_url, auth)
            .send()
            .await
            .map_err(|err| DownloadError::request(file_url, &err))?;
        let response = ensure_success(sent, "download script file")?;
        let reply: FileReply = response
            .json()
            .await
            .map_err(|err| DownloadError::payload(file_url, err))?;
        if !is_allowed_file_name(&reply.file_name) {
            return Err(DownloadError::UnsupportedFileType {
                name: Some(reply.file_name),
            });
        }
        let text = decode_content(file_url, &reply.file_name, &reply.content)?;
        self.cancel.throw_if_cancelled()?;
        info!(name = reply.file_name.as_str(), "downloaded file");
        Ok(ScriptFile::new(reply.file_name, text))
    }

    async fn download_directory(
        &self,
        data: &GitLabUrlData,
        auth: &HttpAuth,
    ) -> Result<ScriptsData, DownloadError> {
        let entries = Self::remove_junk(self.list_directory(data, auth).await?);
        let main_entry = Self::main_file(&entries, &data.file_path)?;
        let main_script = self
            .download_file(&Self::file_url(data, main_entry), auth)
            .await?;

        let mut additional_files = Vec::with_capacity(entries.len().saturating_sub(1));
        for entry in entries.iter().filter(|entry| entry.name != main_entry.name) {
            let file = self.download_file(&Self::file_url(data, entry), auth).await?;
            additional_files.push(file);
        }
        Ok(ScriptsData::with_additional_files(main_script, additional_files))
    }

    fn authorised(&self, url: &str, auth: &HttpAuth) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match auth.secret() {
            Some(secret) => request.header("PRIVATE-TOKEN", secret),
            None => request,
        }
    }
}

impl SourceDownloader for GitLabDownloader {
    fn download<'a>(
        &'a self,
        url: &'a str,
        auth: &'a HttpAuth,
    ) -> DownloadFuture<'a, ScriptsData> {
        Box::pin(async move {
            let data = Self::extract_data(url)?;
            let decoded_path = urlencoding::decode(&data.file_path)
                .map_or_else(|_| data.file_path.clone(), |path| path.into_owned());
            if is_path_to_file(&decoded_path) {
                info!(url, "URL names a file; downloading single file");
                let script = self.download_file(url, auth).await?;
                return Ok(ScriptsData::single(script));
            }
            info!(url, "URL names a directory; downloading its scripts");
            self.download_directory(&data, auth).await
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
