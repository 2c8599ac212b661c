//! Decoding of PowerShell CLIXML error streams.
//!
//! PowerShell serialises stderr as `#< CLIXML` followed by an `<Objs>`
//! document. Error records are `<S S="Error">` elements whose text encodes
//! control and non-ASCII characters as `_xHHHH_` UTF-16 code units.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{debug, warn};

use super::xml;

/// Marker PowerShell writes before a CLIXML document.
pub const CLIXML_MARKER: &str = "#< CLIXML";

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static ESCAPED_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:_x[0-9A-Fa-f]{4}_)+").expect("valid escape run pattern"));

#[expect(clippy::expect_used, reason = "patterns are compile-time constants")]
static ESCAPED_UNIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_x([0-9A-Fa-f]{4})_").expect("valid escape unit pattern"));

/// Returns the human-readable error text carried by `stderr`.
///
/// Text without the CLIXML marker is returned unchanged, as is a document
/// that fails to parse. A well-formed document without error records
/// decodes to an empty string, since it only carried progress records.
#[must_use]
pub fn decode_stderr(stderr: &str) -> String {
    let Some(document) = stderr.trim_start().strip_prefix(CLIXML_MARKER) else {
        return stderr.to_owned();
    };
    match error_records(document) {
        Ok(records) if records.is_empty() => String::new(),
        Ok(records) => {
            let decoded = unescape_code_units(&records.concat());
            debug!(stderr = decoded.as_str(), "decoded CLIXML stderr");
            decoded
        }
        Err(err) => {
            warn!(error = %err, "failed to decode CLIXML stderr");
            stderr.to_owned()
        }
    }
}

fn error_records(document: &str) -> Result<Vec<String>, quick_xml::Error> {
    Ok(xml::elements(document)?
        .into_iter()
        .filter(|element| element.attribute("S") == Some("Error"))
        .map(|element| element.text)
        .collect())
}

/// Replaces `_xHHHH_` runs with the characters they encode, pairing UTF-16
/// surrogates across adjacent units.
#[must_use]
pub fn unescape_code_units(text: &str) -> String {
    ESCAPED_RUN
        .replace_all(text, |run: &Captures<'_>| {
            let units: Vec<u16> = ESCAPED_UNIT
                .captures_iter(run.get(0).map_or("", |found| found.as_str()))
                .filter_map(|unit| unit.get(1))
                .filter_map(|hex| u16::from_str_radix(hex.as_str(), 16).ok())
                .collect();
            String::from_utf16_lossy(&units)
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PROGRESS_ONLY: &str = concat!(
        "#< CLIXML\r\n",
        r#"<Objs Version="1.1.0.1" xmlns="http://schemas.microsoft.com/powershell/2004/04">"#,
        r#"<Obj S="progress" RefId="0"><TN RefId="0"><T>System.Management.Automation.PSCustomObject</T></TN>"#,
        r#"<MS><I64 N="SourceId">1</I64><PR N="Record"><AV>Preparing modules for first use.</AV></PR></MS></Obj>"#,
        "</Objs>"
    );

    #[test]
    fn error_records_are_joined_and_unescaped() {
        let stderr = concat!(
            "#< CLIXML\r\n",
            r#"<Objs Version="1.1.0.1" xmlns="http://schemas.microsoft.com/powershell/2004/04">"#,
            r#"<S S="Error">Cannot find path &apos;C:\missing&apos;_x000D__x000A_</S>"#,
            r#"<S S="Verbose">ignored</S>"#,
            r#"<S S="Error">At line:1 char:1_x000D__x000A_</S>"#,
            "</Objs>"
        );
        assert_eq!(
            decode_stderr(stderr),
            "Cannot find path 'C:\\missing'\r\nAt line:1 char:1\r\n"
        );
    }

    #[test]
    fn progress_only_documents_decode_to_nothing() {
        assert_eq!(decode_stderr(PROGRESS_ONLY), "");
    }

    #[rstest]
    #[case("plain failure text\n")]
    #[case("")]
    #[case("#< CLIXML\r\n<Objs><S S=\"Error\">unterminated</Wrong></Objs>")]
    fn other_text_is_returned_unchanged(#[case] stderr: &str) {
        assert_eq!(decode_stderr(stderr), stderr);
    }

    #[rstest]
    #[case("tab_x0009_here", "tab\there")]
    #[case("caf_x00E9_", "café")]
    #[case("smile _xD83D__xDE00_", "smile 😀")]
    #[case("no_escapes_", "no_escapes_")]
    fn code_units(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(unescape_code_units(text), expected);
    }
}
