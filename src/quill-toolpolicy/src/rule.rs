//! Policy rule and safety-checker rule types.

use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalMode;
use crate::decision::PolicyDecision;

/// Name of the built-in shell tool. The engine decomposes this tool's
/// command argument before matching; the loader accepts the
/// `command_prefix`/`command_regex` shorthands only for this tool.
pub const SHELL_TOOL_NAME: &str = "shell";

/// Separator between an MCP server name and one of its tools, as in
/// `github__create_issue`. `github__*` matches every tool the server
/// exposes.
pub const MCP_TOOL_SEPARATOR: &str = "__";

/// Trust tier a rule's source belongs to. Encoded as the integer part of
/// a rule's final priority, so a higher tier outranks any lower-tier rule
/// regardless of sub-priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Bundled default policies shipped with the CLI.
    Default = 1,
    /// The user's own policy directory and settings.
    User = 2,
    /// The system administrator's policy directory.
    Admin = 3,
}

/// Raw sub-priorities authors may use inside a tier. Anything above this
/// would overflow into the next tier after the transform.
pub const MAX_RAW_PRIORITY: i64 = 999;

impl Tier {
    /// The integer base of this tier's priority band.
    pub fn base(self) -> f64 {
        self as i64 as f64
    }

    /// Transform an author-chosen raw priority (0-999) into the final
    /// priority: `tier + raw / 1000`.
    pub fn transform_priority(self, raw: i64) -> f64 {
        debug_assert!((0..=MAX_RAW_PRIORITY).contains(&raw));
        self.base() + raw as f64 / 1000.0
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Default => write!(f, "default"),
            Tier::User => write!(f, "user"),
            Tier::Admin => write!(f, "admin"),
        }
    }
}

/// Shared tool-name matching: exact, MCP wildcard (`server__*`), or
/// absent (matches everything).
pub(crate) fn tool_name_matches(name: Option<&str>, tool: &str) -> bool {
    match name {
        None => true,
        Some(name) => {
            if name == tool {
                return true;
            }
            name.strip_suffix('*')
                .filter(|prefix| prefix.ends_with(MCP_TOOL_SEPARATOR))
                .is_some_and(|prefix| tool.starts_with(prefix))
        }
    }
}

/// Where a rule came from. Provenance only - never used for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    /// Loaded from a rule file.
    File(PathBuf),
    /// Synthesized from a settings key (e.g. `allowed_tools`).
    Settings(&'static str),
    /// Inserted at runtime by an "always allow" grant.
    RuntimeGrant,
}

/// One concrete, compiled policy rule.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    /// Exact tool name, an MCP wildcard (`server__*`), or `None` to match
    /// any tool.
    pub tool_name: Option<String>,
    /// Compiled pattern tested against the canonical argument string (for
    /// the shell tool, the raw command text). `None` matches any args.
    pub args_pattern: Option<Regex>,
    /// What happens when this rule wins.
    pub decision: PolicyDecision,
    /// Final priority: integer part is the tier, fraction the raw
    /// sub-priority / 1000. Higher wins.
    pub priority: f64,
    /// Approval modes the rule applies to; `None` means all.
    pub modes: Option<Vec<ApprovalMode>>,
    /// Suppresses the redirection downgrade for shell commands.
    pub allow_redirection: bool,
    /// Provenance metadata.
    pub source: RuleSource,
    /// Message shown to the user when a DENY rule fires.
    pub deny_message: Option<String>,
}

impl PolicyRule {
    /// Whether this rule's `tool_name` covers the given tool.
    pub fn matches_tool(&self, tool: &str) -> bool {
        tool_name_matches(self.tool_name.as_deref(), tool)
    }

    /// Whether this rule is eligible in the given approval mode.
    pub fn applies_in_mode(&self, mode: ApprovalMode) -> bool {
        match &self.modes {
            None => true,
            Some(modes) => modes.contains(&mode),
        }
    }

    /// Whether the rule qualifies for the given canonical argument
    /// string. Rules without a pattern always qualify.
    pub fn args_match(&self, canonical_args: &str) -> bool {
        match &self.args_pattern {
            None => true,
            Some(pattern) => pattern.is_match(canonical_args),
        }
    }
}

/// Reference to a pluggable safety checker. A closed set: adding a kind
/// is a compile-time exhaustive match, not runtime type inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CheckerRef {
    /// A checker compiled into this process, looked up by name.
    InProcess {
        name: String,
        #[serde(default)]
        required_context: Vec<String>,
        #[serde(default)]
        config: Option<toml::Value>,
    },
    /// A checker delegated to an external process or service.
    External {
        name: String,
        #[serde(default)]
        required_context: Vec<String>,
        #[serde(default)]
        config: Option<toml::Value>,
    },
}

impl CheckerRef {
    /// The checker's name, regardless of kind.
    pub fn name(&self) -> &str {
        match self {
            CheckerRef::InProcess { name, .. } | CheckerRef::External { name, .. } => name,
        }
    }

    /// Context keys the caller must supply for this checker to run.
    pub fn required_context(&self) -> &[String] {
        match self {
            CheckerRef::InProcess { required_context, .. }
            | CheckerRef::External { required_context, .. } => required_context,
        }
    }
}

/// A pluggable secondary check layered on top of pattern rules. The
/// engine selects matching checkers; running them is the caller's job.
#[derive(Debug, Clone)]
pub struct SafetyCheckerRule {
    /// Same tool-name matching as [`PolicyRule`].
    pub tool_name: Option<String>,
    /// Same argument matching as [`PolicyRule`].
    pub args_pattern: Option<Regex>,
    /// Final (tier-transformed) priority.
    pub priority: f64,
    /// Approval modes the checker applies to; `None` means all.
    pub modes: Option<Vec<ApprovalMode>>,
    /// The checker to invoke.
    pub checker: CheckerRef,
}

impl SafetyCheckerRule {
    /// Whether this checker's `tool_name` covers the given tool.
    pub fn matches_tool(&self, tool: &str) -> bool {
        tool_name_matches(self.tool_name.as_deref(), tool)
    }

    /// Whether this checker is eligible in the given approval mode.
    pub fn applies_in_mode(&self, mode: ApprovalMode) -> bool {
        match &self.modes {
            None => true,
            Some(modes) => modes.contains(&mode),
        }
    }
}
