//! Approval modes.

use serde::{Deserialize, Serialize};

/// The user's current operating posture. Rules may scope themselves to a
/// subset of modes; a rule without a `modes` list applies in all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Plan-only: no side effects expected.
    Plan,
    /// Standard interactive operation.
    #[default]
    Default,
    /// File edits auto-approved, everything else confirmed.
    AutoEdit,
    /// Full auto: maximum autonomy.
    Yolo,
}
