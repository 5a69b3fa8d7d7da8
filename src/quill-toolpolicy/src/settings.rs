//! Non-file configuration feeding the assembler.

use serde::{Deserialize, Serialize};

use crate::approval::ApprovalMode;
use crate::decision::PolicyDecision;
use crate::rule::SHELL_TOOL_NAME;

/// Settings-derived inputs to policy assembly: explicit allow/deny lists
/// and integration trust, as configured outside the rule files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// The user's current approval mode.
    pub approval_mode: ApprovalMode,
    /// Decision when no rule matches. `AskUser` unless configured.
    pub default_decision: PolicyDecision,
    /// Tools the user explicitly allowed. Supports the legacy
    /// `shell(git log)` shorthand for shell command prefixes.
    pub allowed_tools: Vec<String>,
    /// Tools the user explicitly excluded.
    pub excluded_tools: Vec<String>,
    /// MCP servers the user explicitly allowed.
    pub allowed_mcp_servers: Vec<String>,
    /// MCP servers the user explicitly excluded.
    pub excluded_mcp_servers: Vec<String>,
    /// MCP servers the user marked as fully trusted.
    pub trusted_mcp_servers: Vec<String>,
}

/// A parsed `allowed_tools` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ToolSelector {
    /// A plain tool name, matched exactly.
    Tool(String),
    /// The legacy `shell(<prefix>)` shorthand: a shell command prefix.
    ShellPrefix(String),
}

/// Parse one `allowed_tools` entry.
///
/// `shell(git log)` selects shell commands with the prefix `git log`.
/// The parenthesised form is only recognized for the shell tool; any
/// other entry is treated as an exact tool name, parentheses included.
pub(crate) fn parse_tool_selector(entry: &str) -> ToolSelector {
    let entry = entry.trim();
    if let Some((name, rest)) = entry.split_once('(')
        && name.trim() == SHELL_TOOL_NAME
        && let Some(prefix) = rest.strip_suffix(')')
    {
        return ToolSelector::ShellPrefix(prefix.trim().to_string());
    }
    ToolSelector::Tool(entry.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_tool_name() {
        assert_eq!(
            parse_tool_selector("read_file"),
            ToolSelector::Tool("read_file".to_string()),
        );
    }

    #[test]
    fn shell_shorthand() {
        assert_eq!(
            parse_tool_selector("shell(git log)"),
            ToolSelector::ShellPrefix("git log".to_string()),
        );
    }

    #[test]
    fn shorthand_for_other_tools_is_not_rewritten() {
        assert_eq!(
            parse_tool_selector("web_fetch(example.com)"),
            ToolSelector::Tool("web_fetch(example.com)".to_string()),
        );
    }

    #[test]
    fn unterminated_shorthand_is_kept_verbatim() {
        assert_eq!(
            parse_tool_selector("shell(git log"),
            ToolSelector::Tool("shell(git log".to_string()),
        );
    }
}
