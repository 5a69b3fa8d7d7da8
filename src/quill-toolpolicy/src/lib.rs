//! Tool execution policy for the quill CLI.
//!
//! Decides, before any tool runs, whether the invocation is allowed
//! automatically, needs user confirmation, or is denied. Rules come from
//! three trust tiers (bundled defaults, the user's policy directory, the
//! administrator's system directory), from settings, and from runtime
//! "always allow" grants; a higher tier always outranks a lower one.
//!
//! Shell commands get special treatment: the command text is decomposed
//! into its constituent commands (including command substitutions) and
//! every part must pass. Anything the decomposer cannot understand fails
//! closed.

#[cfg(test)]
mod tests;

mod approval;
mod assembler;
mod decision;
mod engine;
mod error;
mod loader;
mod pattern;
mod rule;
mod schema;
mod settings;
mod update;

pub use approval::ApprovalMode;
pub use assembler::{
    POLICY_DIR_ENV, RUNTIME_GRANT_RAW_PRIORITY, admin_policy_dir, assemble, load_policy_config,
    priorities, resolve_policy_paths, user_policy_dir,
};
pub use decision::PolicyDecision;
pub use engine::{PolicyCheckResult, PolicyEngine, PolicyEngineConfig, ToolCallRequest};
pub use error::{PolicyError, PolicyFileError, PolicyFileErrorKind};
pub use loader::{LoadOutcome, POLICY_FILE_EXTENSION, load_policy_files};
pub use pattern::{
    MAX_PATTERN_LENGTH, PatternError, compile_pattern, is_pattern_safe, prefix_to_pattern,
};
pub use rule::{
    CheckerRef, MAX_RAW_PRIORITY, MCP_TOOL_SEPARATOR, PolicyRule, RuleSource, SHELL_TOOL_NAME,
    SafetyCheckerRule, Tier,
};
pub use settings::PolicySettings;
pub use update::{PolicyUpdateEvent, PolicyUpdater};
