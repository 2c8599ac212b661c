//! Script payloads handed from the acquisition layer to the executor.

/// A named script body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptFile {
    name: String,
    text: String,
}

impl ScriptFile {
    /// Creates a script file from its name and body.
    #[must_use]
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// File name, including extension, used on the target host.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Script body.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Interpreter named by a leading `#!` line, split into words.
    ///
    /// A byte-order mark before the `#!` and a trailing `\r` are ignored.
    #[must_use]
    pub fn shebang(&self) -> Option<Vec<&str>> {
        let line = self
            .text
            .trim_start_matches('\u{feff}')
            .strip_prefix("#!")?
            .lines()
            .next()?;
        let words: Vec<&str> = line.split_whitespace().collect();
        (!words.is_empty()).then_some(words)
    }

    /// Lower-cased extension without the leading dot, if any.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        self.name
            .trim()
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }
}

/// A main script plus the companion files that were fetched alongside it.
///
/// `additional_files` never contains the main script, dotfiles, or
/// `README.md`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptsData {
    main_script: ScriptFile,
    additional_files: Vec<ScriptFile>,
}

impl ScriptsData {
    /// Wraps a single script with no companions.
    #[must_use]
    pub const fn single(main_script: ScriptFile) -> Self {
        Self {
            main_script,
            additional_files: Vec::new(),
        }
    }

    /// Builds a bundle from a main script and its companions.
    #[must_use]
    pub const fn with_additional_files(
        main_script: ScriptFile,
        additional_files: Vec<ScriptFile>,
    ) -> Self {
        Self {
            main_script,
            additional_files,
        }
    }

    /// Entry point script.
    #[must_use]
    pub const fn main_script(&self) -> &ScriptFile {
        &self.main_script
    }

    /// Companion files in listing order.
    #[must_use]
    pub fn additional_files(&self) -> &[ScriptFile] {
        &self.additional_files
    }

    /// Consumes the bundle, returning only the main script.
    #[must_use]
    pub fn into_main_script(self) -> ScriptFile {
        self.main_script
    }
}
