//! The policy engine: priority-ordered rule evaluation with shell
//! command decomposition.

use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use quill_shellsplit::{DecomposeError, decompose};

use crate::approval::ApprovalMode;
use crate::decision::PolicyDecision;
use crate::rule::{PolicyRule, SHELL_TOOL_NAME, SafetyCheckerRule};

/// A tool invocation about to happen, as seen by the policy layer.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Fully qualified tool name (`shell`, `read_file`,
    /// `github__create_issue`, ...).
    pub tool_name: String,
    /// The invocation's arguments, as the caller would send them to the
    /// tool.
    pub args: serde_json::Value,
}

impl ToolCallRequest {
    /// A request for the shell tool with the given command text.
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            tool_name: SHELL_TOOL_NAME.to_string(),
            args: serde_json::json!({ "command": command.into() }),
        }
    }

    /// The string rule patterns are tested against.
    ///
    /// For the shell tool this is the raw command text; a plain string
    /// argument is used as-is; anything else is matched against its JSON
    /// serialization.
    pub fn canonical_args(&self) -> String {
        if self.tool_name == SHELL_TOOL_NAME
            && let Some(command) = self.args.get("command").and_then(|value| value.as_str())
        {
            return command.to_string();
        }
        match &self.args {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// The assembled, immutable inputs to a [`PolicyEngine`].
#[derive(Debug, Default)]
pub struct PolicyEngineConfig {
    /// Concrete rules, from every tier plus settings.
    pub rules: Vec<PolicyRule>,
    /// Concrete safety-checker rules.
    pub checkers: Vec<SafetyCheckerRule>,
    /// Decision when no rule matches.
    pub default_decision: PolicyDecision,
    /// Approval mode used by [`PolicyEngine::check`].
    pub approval_mode: ApprovalMode,
}

/// A policy check's outcome, with the rule that produced it.
#[derive(Debug, Clone)]
pub struct PolicyCheckResult {
    /// The decision.
    pub decision: PolicyDecision,
    /// The rule the decision is attributed to. `None` when the default
    /// decision applied (to any part of a shell command).
    pub rule: Option<Arc<PolicyRule>>,
}

impl PolicyCheckResult {
    fn new(decision: PolicyDecision, rule: Option<Arc<PolicyRule>>) -> Self {
        Self { decision, rule }
    }
}

/// Evaluates tool invocations against the loaded rules.
///
/// Thread-safe: checks take a read lock, runtime grants a short write
/// lock. Rules are behind `Arc` so results can carry attribution without
/// copying.
pub struct PolicyEngine {
    rules: RwLock<Vec<Arc<PolicyRule>>>,
    checkers: Vec<SafetyCheckerRule>,
    default_decision: PolicyDecision,
    approval_mode: ApprovalMode,
}

impl PolicyEngine {
    /// Build an engine from an assembled configuration.
    pub fn new(config: PolicyEngineConfig) -> Self {
        Self {
            rules: RwLock::new(config.rules.into_iter().map(Arc::new).collect()),
            checkers: config.checkers,
            default_decision: config.default_decision,
            approval_mode: config.approval_mode,
        }
    }

    /// Decision applied when no rule matches.
    pub fn default_decision(&self) -> PolicyDecision {
        self.default_decision
    }

    /// Approval mode used by [`check`](Self::check).
    pub fn approval_mode(&self) -> ApprovalMode {
        self.approval_mode
    }

    /// Check a request in the engine's configured approval mode.
    pub fn check(&self, request: &ToolCallRequest) -> PolicyCheckResult {
        self.check_in_mode(request, self.approval_mode)
    }

    /// Check a request in an explicit approval mode.
    ///
    /// Shell requests are decomposed and every constituent command is
    /// evaluated; other tools are evaluated atomically.
    pub fn check_in_mode(&self, request: &ToolCallRequest, mode: ApprovalMode) -> PolicyCheckResult {
        let result = if request.tool_name == SHELL_TOOL_NAME {
            self.check_shell(&request.canonical_args(), mode)
        } else {
            self.check_atomic(&request.tool_name, &request.canonical_args(), mode)
        };
        debug!(
            tool = %request.tool_name,
            decision = %result.decision,
            "policy check",
        );
        result
    }

    /// Evaluate a single tool invocation: the highest-priority matching
    /// rule wins; among equal priorities, the first loaded wins.
    fn check_atomic(&self, tool: &str, canonical_args: &str, mode: ApprovalMode) -> PolicyCheckResult {
        let rules = self.read_rules();
        let mut best: Option<&Arc<PolicyRule>> = None;
        for rule in rules.iter() {
            if !rule.matches_tool(tool) || !rule.applies_in_mode(mode) || !rule.args_match(canonical_args) {
                continue;
            }
            match best {
                // strict: equal priority keeps the earlier rule
                Some(current) if rule.priority <= current.priority => {}
                _ => best = Some(rule),
            }
        }
        match best {
            Some(rule) => PolicyCheckResult::new(rule.decision, Some(Arc::clone(rule))),
            None => PolicyCheckResult::new(self.default_decision, None),
        }
    }

    /// Evaluate a shell command by decomposing it and combining per-part
    /// results, most restrictive first.
    fn check_shell(&self, command: &str, mode: ApprovalMode) -> PolicyCheckResult {
        let decomposition = match decompose(command) {
            Ok(decomposition) => decomposition,
            Err(err) => return self.fail_closed(command, &err),
        };
        if decomposition.commands.is_empty() {
            return self.fail_closed(command, &DecomposeError::Empty);
        }

        // First deny wins outright. An Ask result only carries a rule if
        // no part hit the default decision; a default Ask means "nothing
        // vouched for this part", which no rule should take credit for.
        let mut deny: Option<Option<Arc<PolicyRule>>> = None;
        let mut saw_ask = false;
        let mut ask_rule: Option<Arc<PolicyRule>> = None;
        let mut ask_rule_cleared = false;
        let mut first_allow_rule: Option<Arc<PolicyRule>> = None;

        for part in &decomposition.commands {
            let mut result = self.check_atomic(SHELL_TOOL_NAME, part, mode);

            if decomposition.has_redirection
                && result.decision == PolicyDecision::Allow
                && !result.rule.as_ref().is_some_and(|rule| rule.allow_redirection)
            {
                result.decision = PolicyDecision::AskUser;
            }

            match result.decision {
                PolicyDecision::Deny => {
                    if deny.is_none() {
                        deny = Some(result.rule);
                    }
                }
                PolicyDecision::AskUser => {
                    saw_ask = true;
                    match result.rule {
                        Some(rule) if !ask_rule_cleared => {
                            if ask_rule.is_none() {
                                ask_rule = Some(rule);
                            }
                        }
                        Some(_) => {}
                        None => {
                            ask_rule_cleared = true;
                            ask_rule = None;
                        }
                    }
                }
                PolicyDecision::Allow => {
                    if first_allow_rule.is_none() {
                        first_allow_rule = result.rule;
                    }
                }
            }
        }

        if let Some(rule) = deny {
            return PolicyCheckResult::new(PolicyDecision::Deny, rule);
        }
        if saw_ask {
            return PolicyCheckResult::new(PolicyDecision::AskUser, ask_rule);
        }
        PolicyCheckResult::new(PolicyDecision::Allow, first_allow_rule)
    }

    /// Decision for a shell command that could not be decomposed.
    fn fail_closed(&self, command: &str, err: &DecomposeError) -> PolicyCheckResult {
        warn!(command, %err, "could not decompose shell command, failing closed");
        let decision = if self.default_decision == PolicyDecision::Deny {
            PolicyDecision::Deny
        } else {
            PolicyDecision::AskUser
        };
        PolicyCheckResult::new(decision, None)
    }

    /// Insert a rule at runtime, e.g. an "always allow" grant.
    pub fn add_rule(&self, rule: PolicyRule) {
        self.write_rules().push(Arc::new(rule));
    }

    /// A point-in-time copy of the active rules.
    pub fn snapshot_rules(&self) -> Vec<Arc<PolicyRule>> {
        self.read_rules().clone()
    }

    /// The safety checkers that apply to the given tool in the given
    /// mode, highest priority first.
    pub fn checkers_for(&self, tool: &str, mode: ApprovalMode) -> Vec<&SafetyCheckerRule> {
        let mut matching: Vec<&SafetyCheckerRule> = self
            .checkers
            .iter()
            .filter(|checker| checker.matches_tool(tool) && checker.applies_in_mode(mode))
            .collect();
        matching.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        matching
    }

    fn read_rules(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<PolicyRule>>> {
        self.rules
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_rules(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<PolicyRule>>> {
        self.rules
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("rules", &self.read_rules().len())
            .field("checkers", &self.checkers.len())
            .field("default_decision", &self.default_decision)
            .field("approval_mode", &self.approval_mode)
            .finish()
    }
}
