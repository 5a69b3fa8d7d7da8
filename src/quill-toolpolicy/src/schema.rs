//! On-disk rule file schema and shorthand expansion.
//!
//! A policy file is TOML with two optional top-level arrays:
//!
//! ```toml
//! [[rule]]
//! tool_name = "shell"
//! command_prefix = ["git log", "git status"]
//! decision = "allow"
//! priority = 100
//!
//! [[safety_checker]]
//! tool_name = "write_file"
//! priority = 50
//! checker = { type = "in-process", name = "path_guard" }
//! ```
//!
//! Entries are expanded here into concrete [`PolicyRule`]s: tool-name
//! lists and prefix lists multiply out, prefixes become anchored
//! patterns, and raw priorities are folded into the tier band.

use serde::Deserialize;

use crate::approval::ApprovalMode;
use crate::decision::PolicyDecision;
use crate::error::PolicyFileErrorKind;
use crate::pattern::{compile_pattern, prefix_to_pattern};
use crate::rule::{
    CheckerRef, MAX_RAW_PRIORITY, MCP_TOOL_SEPARATOR, PolicyRule, RuleSource, SHELL_TOOL_NAME,
    SafetyCheckerRule, Tier,
};

/// A string or list of strings, accepted interchangeably.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    /// A single value.
    One(String),
    /// Several values.
    Many(Vec<String>),
}

impl StringOrList {
    /// Flatten into a list.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(value) => vec![value],
            StringOrList::Many(values) => values,
        }
    }

    /// The value, if this is a single string (not a list).
    fn as_single(&self) -> Option<&str> {
        match self {
            StringOrList::One(value) => Some(value),
            StringOrList::Many(_) => None,
        }
    }
}

/// One `[[rule]]` entry as written in a policy file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    /// Tool name(s) the rule applies to; absent matches any tool.
    #[serde(default, alias = "toolName")]
    pub tool_name: Option<StringOrList>,
    /// MCP server name; combined with `tool_name` into `server__tool`,
    /// alone into the `server__*` wildcard.
    #[serde(default, alias = "mcpName")]
    pub mcp_name: Option<String>,
    /// Regex tested against the canonical argument string.
    #[serde(default, alias = "argsPattern")]
    pub args_pattern: Option<String>,
    /// Shell-tool shorthand: literal command prefix(es).
    #[serde(default, alias = "commandPrefix")]
    pub command_prefix: Option<StringOrList>,
    /// Shell-tool shorthand: raw regex over the command text.
    #[serde(default, alias = "commandRegex")]
    pub command_regex: Option<String>,
    /// What happens when the rule wins.
    pub decision: PolicyDecision,
    /// Raw sub-priority within the file's tier, 0-999. Required.
    pub priority: i64,
    /// Approval modes the rule applies to; absent means all.
    #[serde(default)]
    pub modes: Option<Vec<ApprovalMode>>,
    /// Suppresses the redirection downgrade.
    #[serde(default)]
    pub allow_redirection: bool,
    /// Message shown when a DENY rule fires.
    #[serde(default, alias = "denyMessage")]
    pub deny_message: Option<String>,
}

/// One `[[safety_checker]]` entry as written in a policy file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckerEntry {
    /// Tool name(s) the checker applies to; absent matches any tool.
    #[serde(default, alias = "toolName")]
    pub tool_name: Option<StringOrList>,
    /// MCP server name, expanded as for rules.
    #[serde(default, alias = "mcpName")]
    pub mcp_name: Option<String>,
    /// Regex tested against the canonical argument string.
    #[serde(default, alias = "argsPattern")]
    pub args_pattern: Option<String>,
    /// Raw sub-priority within the file's tier, 0-999. Defaults to 0.
    #[serde(default)]
    pub priority: i64,
    /// Approval modes the checker applies to; absent means all.
    #[serde(default)]
    pub modes: Option<Vec<ApprovalMode>>,
    /// The checker to invoke.
    pub checker: CheckerRef,
}

/// One problem found while expanding an entry. The loader turns these
/// into [`crate::PolicyFileError`]s with file/rule attribution attached.
#[derive(Debug)]
pub(crate) struct ExpandIssue {
    pub kind: PolicyFileErrorKind,
    pub message: String,
    pub details: Option<String>,
    pub suggestion: Option<String>,
}

impl ExpandIssue {
    fn validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            kind: PolicyFileErrorKind::RuleValidation,
            message: message.into(),
            details: None,
            suggestion: Some(suggestion.into()),
        }
    }

    fn regex(pattern: &str, details: impl Into<String>) -> Self {
        Self {
            kind: PolicyFileErrorKind::RegexCompilation,
            message: format!("pattern `{pattern}` was rejected"),
            details: Some(details.into()),
            suggestion: None,
        }
    }
}

fn expand_tool_names(
    tool_name: Option<StringOrList>,
    mcp_name: Option<String>,
) -> Vec<Option<String>> {
    match (tool_name, mcp_name) {
        (Some(tools), Some(mcp)) => tools
            .into_vec()
            .into_iter()
            .map(|tool| Some(format!("{mcp}{MCP_TOOL_SEPARATOR}{tool}")))
            .collect(),
        (None, Some(mcp)) => vec![Some(format!("{mcp}{MCP_TOOL_SEPARATOR}*"))],
        (Some(tools), None) => tools.into_vec().into_iter().map(Some).collect(),
        (None, None) => vec![None],
    }
}

fn check_priority(raw: i64, issues: &mut Vec<ExpandIssue>) -> bool {
    if (0..=MAX_RAW_PRIORITY).contains(&raw) {
        return true;
    }
    issues.push(ExpandIssue::validation(
        format!("priority {raw} is out of range"),
        format!("use a priority between 0 and {MAX_RAW_PRIORITY}"),
    ));
    false
}

/// Expand one rule entry into zero or more concrete rules.
///
/// A cross-field violation drops the whole entry; a pattern that fails to
/// compile drops only that one expanded rule.
pub(crate) fn expand_rule_entry(
    entry: RuleEntry,
    tier: Tier,
    source: RuleSource,
) -> (Vec<PolicyRule>, Vec<ExpandIssue>) {
    let mut issues = Vec::new();

    if !check_priority(entry.priority, &mut issues) {
        return (Vec::new(), issues);
    }

    let shorthand_count = usize::from(entry.command_prefix.is_some())
        + usize::from(entry.command_regex.is_some())
        + usize::from(entry.args_pattern.is_some());
    if shorthand_count > 1 {
        issues.push(ExpandIssue::validation(
            "command_prefix, command_regex and args_pattern are mutually exclusive",
            "keep exactly one of them",
        ));
        return (Vec::new(), issues);
    }

    if entry.command_prefix.is_some() || entry.command_regex.is_some() {
        let is_shell = entry
            .tool_name
            .as_ref()
            .and_then(StringOrList::as_single)
            .is_some_and(|name| name == SHELL_TOOL_NAME)
            && entry.mcp_name.is_none();
        if !is_shell {
            issues.push(ExpandIssue::validation(
                "command_prefix/command_regex are only valid for the shell tool",
                format!("set tool_name = \"{SHELL_TOOL_NAME}\" (a single string)"),
            ));
            return (Vec::new(), issues);
        }
    }

    // One pattern string per alternative; `None` means match-any-args.
    let patterns: Vec<Option<String>> = if let Some(prefixes) = entry.command_prefix {
        prefixes
            .into_vec()
            .iter()
            .map(|prefix| Some(prefix_to_pattern(prefix)))
            .collect()
    } else if let Some(regex) = entry.command_regex {
        vec![Some(regex)]
    } else if let Some(pattern) = entry.args_pattern {
        vec![Some(pattern)]
    } else {
        vec![None]
    };

    let tool_names = expand_tool_names(entry.tool_name, entry.mcp_name);
    let priority = tier.transform_priority(entry.priority);
    let mut rules = Vec::new();

    for tool_name in &tool_names {
        for pattern in &patterns {
            let args_pattern = match pattern {
                None => None,
                Some(raw) => match compile_pattern(raw) {
                    Ok(compiled) => Some(compiled),
                    Err(err) => {
                        issues.push(ExpandIssue::regex(raw, err.to_string()));
                        continue;
                    }
                },
            };
            rules.push(PolicyRule {
                tool_name: tool_name.clone(),
                args_pattern,
                decision: entry.decision,
                priority,
                modes: entry.modes.clone(),
                allow_redirection: entry.allow_redirection,
                source: source.clone(),
                deny_message: entry.deny_message.clone(),
            });
        }
    }

    (rules, issues)
}

/// Expand one safety-checker entry into zero or more concrete checker
/// rules.
pub(crate) fn expand_checker_entry(
    entry: CheckerEntry,
    tier: Tier,
) -> (Vec<SafetyCheckerRule>, Vec<ExpandIssue>) {
    let mut issues = Vec::new();

    if !check_priority(entry.priority, &mut issues) {
        return (Vec::new(), issues);
    }

    let pattern = match &entry.args_pattern {
        None => None,
        Some(raw) => match compile_pattern(raw) {
            Ok(compiled) => Some(compiled),
            Err(err) => {
                issues.push(ExpandIssue::regex(raw, err.to_string()));
                return (Vec::new(), issues);
            }
        },
    };

    let priority = tier.transform_priority(entry.priority);
    let checkers = expand_tool_names(entry.tool_name, entry.mcp_name)
        .into_iter()
        .map(|tool_name| SafetyCheckerRule {
            tool_name,
            args_pattern: pattern.clone(),
            priority,
            modes: entry.modes.clone(),
            checker: entry.checker.clone(),
        })
        .collect();

    (checkers, issues)
}
