//! Recursive decomposition of a compound command string.

use serde::{Deserialize, Serialize};

use crate::lexer::{self, DecomposeError};

/// Substitutions may nest, but not without bound.
pub(crate) const MAX_NESTING_DEPTH: usize = 32;

/// The result of decomposing one shell command string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    /// Every syntactically standalone command found in the string, in
    /// emission order: the whole string first, then each operator side
    /// and substitution body, outer-to-inner and left-to-right.
    pub commands: Vec<String>,
    /// Whether the string contains an unquoted redirection operator
    /// anywhere (`>`, `>>`, `<`, `2>`, `&>`, ...).
    pub has_redirection: bool,
}

/// Decompose a shell command string into every sub-command it would run.
///
/// ```
/// let d = quill_shellsplit::decompose("echo $(git log) && ls").unwrap();
/// assert_eq!(
///     d.commands,
///     vec!["echo $(git log) && ls", "echo $(git log)", "git log", "ls"],
/// );
/// assert!(!d.has_redirection);
/// ```
///
/// # Errors
///
/// Returns a [`DecomposeError`] when the string is empty or uses syntax
/// the lexer does not model. Callers must fail closed on any error.
pub fn decompose(command: &str) -> Result<Decomposition, DecomposeError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(DecomposeError::Empty);
    }

    let mut commands = Vec::new();
    walk(trimmed, 0, &mut commands)?;

    Ok(Decomposition {
        commands,
        has_redirection: lexer::detect_redirection(trimmed),
    })
}

fn walk(command: &str, depth: usize, out: &mut Vec<String>) -> Result<(), DecomposeError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(DecomposeError::TooDeep);
    }

    let trimmed = command.trim();
    if trimmed.is_empty() {
        // a substitution body that was pure whitespace
        return Ok(());
    }

    let segments = lexer::split_top_level(trimmed)?;
    out.push(trimmed.to_string());

    if segments.len() > 1 {
        for segment in &segments {
            walk(segment, depth + 1, out)?;
        }
    } else {
        for body in lexer::extract_substitutions(trimmed)? {
            walk(&body, depth + 1, out)?;
        }
    }

    Ok(())
}
