//! Error types for rule loading and policy maintenance.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::rule::Tier;

/// Stage at which a rule file (or one rule within it) was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFileErrorKind {
    /// The path exists but could not be read. Not-found is not an error.
    FileRead,
    /// The file is not valid TOML.
    TomlParse,
    /// Valid TOML with the wrong shape, types, or a missing required
    /// field.
    SchemaValidation,
    /// Valid shape violating a cross-field constraint, e.g.
    /// `command_prefix` combined with `args_pattern`.
    RuleValidation,
    /// A pattern failed to compile or failed the safety screen.
    RegexCompilation,
}

/// One diagnostic produced while loading rule files.
///
/// These are collected and handed back to the caller for user-facing
/// reporting; they are never raised. A bad file, or a bad rule inside an
/// otherwise valid file, drops only itself.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyFileError {
    /// Full path of the offending file.
    pub file_path: PathBuf,
    /// File name only, for compact display.
    pub file_name: String,
    /// Tier the file was loaded under.
    pub tier: Tier,
    /// Index of the offending rule within the file, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_index: Option<usize>,
    /// The stage that rejected it.
    pub kind: PolicyFileErrorKind,
    /// Human-readable summary.
    pub message: String,
    /// Underlying parser/compiler output, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// A fix hint, when one is cheap to compute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl PolicyFileError {
    /// Create an error for the given file and stage.
    pub fn new(
        file_path: impl Into<PathBuf>,
        tier: Tier,
        kind: PolicyFileErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let file_path: PathBuf = file_path.into();
        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.display().to_string());
        Self {
            file_path,
            file_name,
            tier,
            rule_index: None,
            kind,
            message: message.into(),
            details: None,
            suggestion: None,
        }
    }

    /// Attach the index of the offending rule.
    pub fn with_rule_index(mut self, index: usize) -> Self {
        self.rule_index = Some(index);
        self
    }

    /// Attach underlying parser/compiler output.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attach a fix hint.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for PolicyFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.file_name, self.tier)?;
        if let Some(index) = self.rule_index {
            write!(f, " rule #{index}")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({suggestion})")?;
        }
        Ok(())
    }
}

/// Errors from policy maintenance paths (runtime grants, persistence).
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A runtime grant supplied a pattern that failed screening or
    /// compilation.
    #[error(transparent)]
    Pattern(#[from] crate::pattern::PatternError),

    /// Persisting a rule to disk failed.
    #[error("failed to persist policy rule: {0}")]
    Persistence(#[from] std::io::Error),

    /// Serializing the auto-saved rule file failed.
    #[error("failed to serialize policy file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Shorthand used by the loader when a read fails for a reason other than
/// not-found.
pub(crate) fn read_error(path: &Path, tier: Tier, err: &std::io::Error) -> PolicyFileError {
    PolicyFileError::new(
        path,
        tier,
        PolicyFileErrorKind::FileRead,
        format!("failed to read policy file: {err}"),
    )
}
