//! Plain HTTP(S) downloads with the authentication fallback chain.

use reqwest::header::LOCATION;
use reqwest::{Client, Response};
use tracing::{debug, info, warn};
use url::Url;

use super::dispatch::authentication_plan;
use super::{
    AuthStrategy, DownloadConfig, DownloadError, DownloadFuture, HttpAuth, Redirects,
    SourceDownloader, build_client, ensure_success, filename,
};
use crate::cancel::CancellationSampler;
use crate::script::{ScriptFile, ScriptsData};

const HTML_MARKER: &str = "<!doctype html>";

/// Downloads a script from any HTTP(S) URL.
#[derive(Clone, Debug)]
pub struct GenericHttpDownloader {
    following: Client,
    manual: Client,
    max_redirects: u32,
    cancel: CancellationSampler,
}

impl GenericHttpDownloader {
    /// Builds the HTTP clients used by the chain.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Request`] when the TLS backend cannot be
    /// initialised.
    pub fn new(
        config: &DownloadConfig,
        cancel: CancellationSampler,
        verify_tls: bool,
    ) -> Result<Self, DownloadError> {
        Ok(Self {
            following: build_client(config, verify_tls, Redirects::Follow)?,
            manual: build_client(config, verify_tls, Redirects::Manual)?,
            max_redirects: config.max_redirects,
            cancel,
        })
    }

    /// Runs the authentication chain for `url` and returns the first script
    /// a strategy manages to fetch.
    ///
    /// Only HTTP status failures fall through to the next strategy; transport
    /// failures, malformed payloads and cancellation end the chain.
    ///
    /// # Errors
    ///
    /// Returns the last [`DownloadError::HttpStatus`] when every strategy is
    /// refused, or the first non-status error encountered.
    pub async fn download_script(
        &self,
        url: &str,
        auth: &HttpAuth,
    ) -> Result<ScriptFile, DownloadError> {
        let mut last_refusal = None;
        for strategy in authentication_plan(url, auth) {
            info!(url, strategy = strategy.label(), "attempting download");
            match self.fetch(url, &strategy).await {
                Ok(script) => {
                    info!(name = script.name(), strategy = strategy.label(), "script downloaded");
                    return Ok(script);
                }
                Err(err @ DownloadError::HttpStatus { .. }) => {
                    warn!(strategy = strategy.label(), error = %err, "authentication strategy refused");
                    last_refusal = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_refusal.unwrap_or_else(|| DownloadError::Request {
            url: url.to_owned(),
            message: String::from("no authentication strategy applies"),
        }))
    }

    /// Fetches `url` with a single strategy.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HttpStatus`] for non-2xx replies and the
    /// body validation errors of [`GenericHttpDownloader::read_script`].
    pub async fn fetch(
        &self,
        url: &str,
        strategy: &AuthStrategy,
    ) -> Result<ScriptFile, DownloadError> {
        self.cancel.throw_if_cancelled()?;
        let sent = match strategy {
            AuthStrategy::GitLabPrivateToken { api_url, token } => {
                self.send(api_url, self.following.get(api_url).header("Private-Token", token))
                    .await?
            }
            AuthStrategy::Bearer { token } => self.get_with_bearer(url, token).await?,
            AuthStrategy::Basic { username, password } => {
                self.send(url, self.following.get(url).basic_auth(username, Some(password)))
                    .await?
            }
            AuthStrategy::Anonymous => self.send(url, self.following.get(url)).await?,
        };
        let response = ensure_success(sent, "download script file")?;
        self.read_script(response).await
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Response, DownloadError> {
        request
            .send()
            .await
            .map_err(|err| DownloadError::request(url, &err))
    }

    async fn get_with_bearer(&self, url: &str, token: &str) -> Result<Response, DownloadError> {
        let mut current = Url::parse(url).map_err(|err| DownloadError::Request {
            url: url.to_owned(),
            message: err.to_string(),
        })?;
        let mut hops = 0;
        loop {
            let response = self
                .send(current.as_str(), self.manual.get(current.clone()).bearer_auth(token))
                .await?;
            if !response.status().is_redirection() || hops >= self.max_redirects {
                return Ok(response);
            }
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                return Ok(response);
            };
            current = response
                .url()
                .join(location)
                .map_err(|err| DownloadError::payload(response.url().as_str(), err))?;
            hops += 1;
            debug!(location = %current, hops, "following redirect with bearer token");
            self.cancel.throw_if_cancelled()?;
        }
    }

    /// Streams a successful response body into a [`ScriptFile`].
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnsupportedFileType`] when no script name can
    /// be determined, [`DownloadError::InvalidEncoding`] for non-UTF-8
    /// bodies, [`DownloadError::NotAScript`] for HTML pages, and
    /// [`DownloadError::Cancelled`] when cancellation is observed between
    /// chunks.
    pub async fn read_script(&self, mut response: Response) -> Result<ScriptFile, DownloadError> {
        let final_url = response.url().clone();
        let name = filename::resolve(response.headers(), &final_url)?;
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| DownloadError::request(final_url.as_str(), &err))?
        {
            body.extend_from_slice(&chunk);
            self.cancel.throw_if_cancelled()?;
        }
        let text = String::from_utf8(body)
            .map_err(|_| DownloadError::InvalidEncoding { name: name.clone() })?;
        if looks_like_html(&text) {
            return Err(DownloadError::NotAScript {
                url: final_url.to_string(),
            });
        }
        Ok(ScriptFile::new(name, text))
    }
}

impl SourceDownloader for GenericHttpDownloader {
    fn download<'a>(
        &'a self,
        url: &'a str,
        auth: &'a HttpAuth,
    ) -> DownloadFuture<'a, ScriptsData> {
        Box::pin(async move { self.download_script(url, auth).await.map(ScriptsData::single) })
    }
}

/// Detects HTML error pages served with a success status.
pub(crate) fn looks_like_html(text: &str) -> bool {
    text.trim_start_matches(['\n', '\r'])
        .get(..HTML_MARKER.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(HTML_MARKER))
}
