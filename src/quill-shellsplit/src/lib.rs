//! Quill Shellsplit - recursive shell command decomposition.
//!
//! Before the policy engine can evaluate a shell command it has to know
//! every command that string would actually run. A narrowly-scoped allow
//! rule for `git log` must not be abusable via `git log && rm -rf /`,
//! `echo $(rm -rf /)` or `diff <(git log) <(rm -rf /)`.
//!
//! [`decompose`] extracts every syntactically distinct sub-command from a
//! compound command string:
//! - sequencing and logical operators (`;`, `&&`, `||`), pipelines (`|`)
//!   and background jobs (`&`) split into their sides, with the whole
//!   original string retained as an entry of its own;
//! - command substitution (`$(...)`, backticks) and process substitution
//!   (`<(...)`, `>(...)`) bodies are decomposed transitively;
//! - redirection operators are reported separately via
//!   [`Decomposition::has_redirection`].
//!
//! Anything the lexer cannot account for (unbalanced quotes, heredocs,
//! malformed operators, foreign dialects) is an error. Callers must treat
//! an error as "unsafe/unknown", never as "nothing to check".


mod decompose;
mod lexer;

pub use decompose::{Decomposition, decompose};
pub use lexer::DecomposeError;
