//! Assembles the engine configuration from tier directories and settings.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::engine::PolicyEngineConfig;
use crate::error::PolicyFileError;
use crate::loader::{LoadOutcome, load_policy_files};
use crate::pattern::{compile_pattern, prefix_to_pattern};
use crate::rule::{MCP_TOOL_SEPARATOR, PolicyRule, RuleSource, SHELL_TOOL_NAME, Tier};
use crate::settings::{PolicySettings, ToolSelector, parse_tool_selector};

/// Fixed priorities for rules synthesized from settings and runtime
/// grants. All sit inside the User tier: always dominated by any
/// Admin-tier rule, always dominating Default-tier file rules, with a
/// fixed internal ordering among themselves.
pub mod priorities {
    /// MCP server explicitly excluded in settings.
    pub const EXCLUDED_MCP_SERVER: f64 = 2.9;
    /// Tool explicitly excluded in settings.
    pub const EXCLUDED_TOOL: f64 = 2.4;
    /// Tool explicitly allowed in settings.
    pub const ALLOWED_TOOL: f64 = 2.3;
    /// MCP server marked trusted in settings.
    pub const TRUSTED_MCP_SERVER: f64 = 2.2;
    /// MCP server explicitly allowed in settings.
    pub const ALLOWED_MCP_SERVER: f64 = 2.1;
    /// Rule inserted by a runtime "always allow" grant: above every
    /// other User-tier constant, still below Admin.
    pub const RUNTIME_GRANT: f64 = 2.95;
}

/// Raw (pre-transform) sub-priority matching [`priorities::RUNTIME_GRANT`],
/// used when a grant is persisted to the user's auto-saved file.
pub const RUNTIME_GRANT_RAW_PRIORITY: i64 = 950;

/// Environment variable overriding the user policy directory.
pub const POLICY_DIR_ENV: &str = "QUILL_POLICY_DIR";

/// The system administrator's policy directory.
pub fn admin_policy_dir() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\quill\policies")
    } else {
        PathBuf::from("/etc/quill/policies")
    }
}

/// The user's policy directory: `$QUILL_POLICY_DIR` or
/// `~/.quill/policies`.
pub fn user_policy_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(POLICY_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quill")
        .join("policies")
}

/// Resolve the ordered tier paths: Admin system directory first, then the
/// user's directory (or explicit override paths), then the bundled
/// default-policies directory.
///
/// An Admin directory that is writable by group or world is skipped with
/// a warning rather than silently trusted.
pub fn resolve_policy_paths(
    user_overrides: Option<&[PathBuf]>,
    bundled_defaults: Option<&Path>,
) -> Vec<(PathBuf, Tier)> {
    let mut paths = Vec::new();

    let admin = admin_policy_dir();
    if admin_dir_is_trusted(&admin) {
        paths.push((admin, Tier::Admin));
    }

    match user_overrides {
        Some(overrides) => {
            for path in overrides {
                paths.push((path.clone(), Tier::User));
            }
        }
        None => paths.push((user_policy_dir(), Tier::User)),
    }

    if let Some(defaults) = bundled_defaults {
        paths.push((defaults.to_path_buf(), Tier::Default));
    }

    paths
}

#[cfg(unix)]
fn admin_dir_is_trusted(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        // missing is fine; the loader skips it
        Err(_) => return true,
    };
    let mode = metadata.permissions().mode();
    if mode & 0o022 != 0 {
        warn!(
            path = %path.display(),
            mode = format!("{:o}", mode & 0o777),
            "admin policy directory is group/world-writable, skipping it",
        );
        return false;
    }
    true
}

#[cfg(not(unix))]
fn admin_dir_is_trusted(_path: &Path) -> bool {
    true
}

fn server_wildcard(server: &str) -> String {
    format!("{server}{MCP_TOOL_SEPARATOR}*")
}

fn settings_rule(
    tool_name: Option<String>,
    decision: crate::PolicyDecision,
    priority: f64,
    key: &'static str,
) -> PolicyRule {
    PolicyRule {
        tool_name,
        args_pattern: None,
        decision,
        priority,
        modes: None,
        allow_redirection: false,
        source: RuleSource::Settings(key),
        deny_message: None,
    }
}

/// Synthesize rules from settings and merge them with loader output into
/// one immutable engine configuration.
pub fn assemble(outcome: LoadOutcome, settings: &PolicySettings) -> (PolicyEngineConfig, Vec<PolicyFileError>) {
    use crate::PolicyDecision::{Allow, Deny};

    let LoadOutcome {
        mut rules,
        checkers,
        errors,
    } = outcome;

    for server in &settings.excluded_mcp_servers {
        rules.push(settings_rule(
            Some(server_wildcard(server)),
            Deny,
            priorities::EXCLUDED_MCP_SERVER,
            "excluded_mcp_servers",
        ));
    }

    for tool in &settings.excluded_tools {
        rules.push(settings_rule(
            Some(tool.clone()),
            Deny,
            priorities::EXCLUDED_TOOL,
            "excluded_tools",
        ));
    }

    for entry in &settings.allowed_tools {
        match parse_tool_selector(entry) {
            ToolSelector::Tool(name) => {
                rules.push(settings_rule(
                    Some(name),
                    Allow,
                    priorities::ALLOWED_TOOL,
                    "allowed_tools",
                ));
            }
            ToolSelector::ShellPrefix(prefix) => {
                let pattern = prefix_to_pattern(&prefix);
                match compile_pattern(&pattern) {
                    Ok(compiled) => {
                        let mut rule = settings_rule(
                            Some(SHELL_TOOL_NAME.to_string()),
                            Allow,
                            priorities::ALLOWED_TOOL,
                            "allowed_tools",
                        );
                        rule.args_pattern = Some(compiled);
                        rules.push(rule);
                    }
                    Err(err) => {
                        warn!(entry = entry.as_str(), %err, "ignoring unusable allowed_tools entry");
                    }
                }
            }
        }
    }

    for server in &settings.trusted_mcp_servers {
        rules.push(settings_rule(
            Some(server_wildcard(server)),
            Allow,
            priorities::TRUSTED_MCP_SERVER,
            "trusted_mcp_servers",
        ));
    }

    for server in &settings.allowed_mcp_servers {
        rules.push(settings_rule(
            Some(server_wildcard(server)),
            Allow,
            priorities::ALLOWED_MCP_SERVER,
            "allowed_mcp_servers",
        ));
    }

    debug!(
        rules = rules.len(),
        checkers = checkers.len(),
        errors = errors.len(),
        "assembled policy configuration",
    );

    (
        PolicyEngineConfig {
            rules,
            checkers,
            default_decision: settings.default_decision,
            approval_mode: settings.approval_mode,
        },
        errors,
    )
}

/// Resolve tier paths, load every policy file and assemble the engine
/// configuration in one step.
pub fn load_policy_config(
    user_overrides: Option<&[PathBuf]>,
    bundled_defaults: Option<&Path>,
    settings: &PolicySettings,
) -> (PolicyEngineConfig, Vec<PolicyFileError>) {
    let paths = resolve_policy_paths(user_overrides, bundled_defaults);
    let outcome = load_policy_files(&paths);
    assemble(outcome, settings)
}
