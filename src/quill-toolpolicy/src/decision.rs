//! Policy decision types.

use serde::{Deserialize, Serialize};

/// Outcome of a policy check for a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    /// Execution authorized automatically.
    Allow,
    /// Requires user confirmation. The engine only ever returns this as a
    /// value; prompting is entirely the caller's responsibility.
    AskUser,
    /// Execution prohibited.
    Deny,
}

impl Default for PolicyDecision {
    fn default() -> Self {
        Self::AskUser
    }
}

impl PolicyDecision {
    /// Returns true if the decision allows execution (possibly after
    /// confirmation).
    pub fn allows_execution(&self) -> bool {
        matches!(self, PolicyDecision::Allow | PolicyDecision::AskUser)
    }

    /// Returns true if the decision requires user interaction.
    pub fn requires_confirmation(&self) -> bool {
        matches!(self, PolicyDecision::AskUser)
    }

    /// Returns true if the decision blocks execution.
    pub fn is_blocked(&self) -> bool {
        matches!(self, PolicyDecision::Deny)
    }

    /// Combine two decisions, taking the most restrictive.
    pub fn combine(self, other: PolicyDecision) -> PolicyDecision {
        match (self, other) {
            (PolicyDecision::Deny, _) | (_, PolicyDecision::Deny) => PolicyDecision::Deny,
            (PolicyDecision::AskUser, _) | (_, PolicyDecision::AskUser) => PolicyDecision::AskUser,
            _ => PolicyDecision::Allow,
        }
    }
}

impl std::fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyDecision::Allow => write!(f, "ALLOW"),
            PolicyDecision::AskUser => write!(f, "ASK_USER"),
            PolicyDecision::Deny => write!(f, "DENY"),
        }
    }
}
