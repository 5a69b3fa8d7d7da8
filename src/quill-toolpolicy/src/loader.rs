//! Tiered rule file loader.
//!
//! Walks an ordered list of `(path, tier)` pairs - directories or
//! individual files - and produces a flat rule list plus a list of load
//! errors. Loading never aborts: a bad file, or one bad rule inside an
//! otherwise valid file, drops only itself.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{PolicyFileError, PolicyFileErrorKind, read_error};
use crate::rule::{PolicyRule, RuleSource, SafetyCheckerRule, Tier};
use crate::schema::{CheckerEntry, ExpandIssue, RuleEntry, expand_checker_entry, expand_rule_entry};

/// Structured-rule files use this extension.
pub const POLICY_FILE_EXTENSION: &str = "toml";

/// Everything one load pass produced.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    /// Concrete rules, flattened across every processed path.
    pub rules: Vec<PolicyRule>,
    /// Concrete safety-checker rules.
    pub checkers: Vec<SafetyCheckerRule>,
    /// Collected diagnostics; handed back to the caller, never raised.
    pub errors: Vec<PolicyFileError>,
}

impl LoadOutcome {
    /// Concatenate another outcome onto this one.
    pub fn merge(&mut self, other: LoadOutcome) {
        self.rules.extend(other.rules);
        self.checkers.extend(other.checkers);
        self.errors.extend(other.errors);
    }
}

/// Load every policy file under the given paths, in order.
///
/// Missing paths are skipped silently; they are a normal state, not an
/// error. Directory entries are read in sorted order so a reload of the
/// same inputs yields an identical outcome.
pub fn load_policy_files(paths: &[(PathBuf, Tier)]) -> LoadOutcome {
    let mut outcome = LoadOutcome::default();
    for (path, tier) in paths {
        load_path(path, *tier, &mut outcome);
    }
    outcome
}

fn load_path(path: &Path, tier: Tier, outcome: &mut LoadOutcome) {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "policy path does not exist, skipping");
            return;
        }
        Err(err) => {
            outcome.errors.push(read_error(path, tier, &err));
            return;
        }
    };

    if !metadata.is_dir() {
        load_file(path, tier, outcome);
        return;
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            outcome.errors.push(read_error(path, tier, &err));
            return;
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|candidate| {
            candidate.is_file()
                && candidate.extension().and_then(|ext| ext.to_str()) == Some(POLICY_FILE_EXTENSION)
        })
        .collect();
    // read_dir order is platform-dependent
    files.sort();

    for file in &files {
        load_file(file, tier, outcome);
    }
}

fn issue_to_error(path: &Path, tier: Tier, index: usize, issue: ExpandIssue) -> PolicyFileError {
    let mut error =
        PolicyFileError::new(path, tier, issue.kind, issue.message).with_rule_index(index);
    error.details = issue.details;
    error.suggestion = issue.suggestion;
    error
}

fn load_file(path: &Path, tier: Tier, outcome: &mut LoadOutcome) {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return,
        Err(err) => {
            outcome.errors.push(read_error(path, tier, &err));
            return;
        }
    };

    let value: toml::Value = match content.parse() {
        Ok(value) => value,
        Err(err) => {
            outcome.errors.push(
                PolicyFileError::new(
                    path,
                    tier,
                    PolicyFileErrorKind::TomlParse,
                    "policy file is not valid TOML",
                )
                .with_details(err.to_string()),
            );
            return;
        }
    };

    let Some(table) = value.as_table() else {
        outcome.errors.push(PolicyFileError::new(
            path,
            tier,
            PolicyFileErrorKind::SchemaValidation,
            "policy file must be a TOML table",
        ));
        return;
    };

    for key in table.keys() {
        if key != "rule" && key != "safety_checker" {
            outcome.errors.push(
                PolicyFileError::new(
                    path,
                    tier,
                    PolicyFileErrorKind::SchemaValidation,
                    format!("unknown top-level key `{key}`"),
                )
                .with_suggestion("policy files contain only [[rule]] and [[safety_checker]]"),
            );
            return;
        }
    }

    let rule_items = match table.get("rule") {
        None => &[][..],
        Some(toml::Value::Array(items)) => items.as_slice(),
        Some(_) => {
            outcome.errors.push(
                PolicyFileError::new(
                    path,
                    tier,
                    PolicyFileErrorKind::SchemaValidation,
                    "`rule` must be an array of tables",
                )
                .with_suggestion("use [[rule]] entries"),
            );
            return;
        }
    };

    let checker_items = match table.get("safety_checker") {
        None => &[][..],
        Some(toml::Value::Array(items)) => items.as_slice(),
        Some(_) => {
            outcome.errors.push(
                PolicyFileError::new(
                    path,
                    tier,
                    PolicyFileErrorKind::SchemaValidation,
                    "`safety_checker` must be an array of tables",
                )
                .with_suggestion("use [[safety_checker]] entries"),
            );
            return;
        }
    };

    let mut loaded_rules = 0usize;
    for (index, item) in rule_items.iter().enumerate() {
        let entry: RuleEntry = match item.clone().try_into() {
            Ok(entry) => entry,
            Err(err) => {
                outcome.errors.push(
                    PolicyFileError::new(
                        path,
                        tier,
                        PolicyFileErrorKind::SchemaValidation,
                        "rule entry has the wrong shape",
                    )
                    .with_rule_index(index)
                    .with_details(err.to_string()),
                );
                continue;
            }
        };

        let (rules, issues) = expand_rule_entry(entry, tier, RuleSource::File(path.to_path_buf()));
        for issue in issues {
            outcome.errors.push(issue_to_error(path, tier, index, issue));
        }
        loaded_rules += rules.len();
        outcome.rules.extend(rules);
    }

    let mut loaded_checkers = 0usize;
    for (index, item) in checker_items.iter().enumerate() {
        let entry: CheckerEntry = match item.clone().try_into() {
            Ok(entry) => entry,
            Err(err) => {
                outcome.errors.push(
                    PolicyFileError::new(
                        path,
                        tier,
                        PolicyFileErrorKind::SchemaValidation,
                        "safety_checker entry has the wrong shape",
                    )
                    .with_rule_index(index)
                    .with_details(err.to_string()),
                );
                continue;
            }
        };

        let (checkers, issues) = expand_checker_entry(entry, tier);
        for issue in issues {
            outcome.errors.push(issue_to_error(path, tier, index, issue));
        }
        loaded_checkers += checkers.len();
        outcome.checkers.extend(checkers);
    }

    debug!(
        path = %path.display(),
        tier = %tier,
        rules = loaded_rules,
        checkers = loaded_checkers,
        "loaded policy file",
    );
}
