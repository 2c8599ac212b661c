//! File name discovery for generic HTTP downloads.
//!
//! Servers name the payload in different places. The lookup order is a
//! `Content-Disposition` header, Artifactory's `X-Artifactory-Filename`
//! header, the last segment of the final (post-redirect) URL, and finally
//! any `<name>.<ext>` segment anywhere in the decoded URL, which catches
//! GitLab raw endpoints such as `.../files/dir%2Frun%2Esh/raw?ref=main`.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::header::HeaderMap;
use url::Url;

use super::DownloadError;

const FILENAME: &str = r#"(?P<filename>[^/\\&?"]*?[^/\\&?"\s]\.(?:sh|bash|ps1))"#;

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static DISPOSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"(?i)^\s*(?:inline|attachment|extension-token)\s*;\s*filename\s*=\s*"?{FILENAME}"?\s*(?:[;?&].*)?$"#
    ))
    .expect("valid content-disposition pattern")
});

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static PLAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r#"(?i)^\s*"?{FILENAME}"?\s*(?:[?&].*)?$"#)).expect("valid file name pattern")
});

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static URL_TAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i).*/(?P<filename>[^/]+\.(?:sh|bash|ps1))").expect("valid url tail pattern")
});

/// Determines the script name for a response served from `final_url`.
pub(crate) fn resolve(headers: &HeaderMap, final_url: &Url) -> Result<String, DownloadError> {
    from_headers(headers)
        .or_else(|| from_last_segment(final_url))
        .or_else(|| from_anywhere_in_url(final_url))
        .map(|name| name.trim().to_owned())
        .ok_or(DownloadError::UnsupportedFileType { name: None })
}

fn from_headers(headers: &HeaderMap) -> Option<String> {
    let patterns: [(&str, &Regex); 2] = [
        ("content-disposition", &DISPOSITION),
        ("x-artifactory-filename", &PLAIN),
    ];
    patterns.into_iter().find_map(|(header, pattern)| {
        let value = headers.get(header)?.to_str().ok()?;
        capture(pattern, value)
    })
}

fn from_last_segment(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(segment).ok()?;
    capture(&PLAIN, &decoded)
}

fn from_anywhere_in_url(url: &Url) -> Option<String> {
    let decoded = urlencoding::decode(url.as_str()).ok()?;
    capture(&URL_TAIL, &decoded)
}

fn capture(pattern: &Regex, haystack: &str) -> Option<String> {
    pattern
        .captures(haystack)?
        .name("filename")
        .map(|found| found.as_str().to_owned())
}
