//! Output sinks receiving script output and operator warnings.

use std::io::Write;
use std::sync::Mutex;

use tracing::warn;

/// Destination for text produced while executing a script.
pub trait OutputSink: Send + Sync {
    /// Writes script output.
    fn write(&self, text: &str);

    /// Writes an operator-facing warning.
    fn write_warning(&self, text: &str);
}

/// [`OutputSink`] over any [`Write`] implementation.
///
/// NUL characters are removed before writing and empty messages are
/// dropped.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    /// Wraps `writer`.
    pub const fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Returns the wrapped writer.
    ///
    /// # Errors
    ///
    /// Returns the writer's poison error when a writer thread panicked.
    pub fn into_inner(self) -> Result<W, std::sync::PoisonError<W>> {
        self.writer.into_inner()
    }

    fn emit(&self, text: &str) {
        let cleaned = strip_nul(text);
        if cleaned.is_empty() {
            return;
        }
        let Ok(mut writer) = self.writer.lock() else {
            warn!("output sink lock poisoned; dropping output");
            return;
        };
        if let Err(err) = writer
            .write_all(cleaned.as_bytes())
            .and_then(|()| writer.flush())
        {
            warn!(error = %err, "failed to write script output");
        }
    }
}

impl<W: Write + Send> OutputSink for WriterSink<W> {
    fn write(&self, text: &str) {
        self.emit(text);
    }

    fn write_warning(&self, text: &str) {
        self.emit(&format!("WARNING: {text}"));
    }
}

/// Removes NUL characters.
#[must_use]
pub fn strip_nul(text: &str) -> String {
    text.replace('\0', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_sink_strips_nul_and_prefixes_warnings() {
        let sink = WriterSink::new(Vec::new());
        sink.write("o\0k\n");
        sink.write_warning("careful\n");
        let written = sink.into_inner().expect("writer should not be poisoned");
        assert_eq!(
            String::from_utf8(written).expect("utf-8 output"),
            "ok\nWARNING: careful\n"
        );
    }
}
