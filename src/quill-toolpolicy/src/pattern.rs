//! Pattern helpers: prefix escaping, safety screening, compilation.

use regex::Regex;
use thiserror::Error;

/// Patterns longer than this are rejected outright.
pub const MAX_PATTERN_LENGTH: usize = 1000;

/// Errors from pattern screening or compilation.
#[derive(Debug, Error)]
pub enum PatternError {
    /// The pattern failed the safety screen (overlong, or nested
    /// unbounded quantifiers).
    #[error("pattern failed safety screening: `{0}`")]
    Unsafe(String),

    /// The pattern is not a valid regex.
    #[error("pattern `{pattern}` failed to compile: {source}")]
    Compile {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Build the anchored regex source for a literal command prefix.
///
/// `"git log"` becomes a pattern that matches `git log` and
/// `git log --oneline` but not `git logout`: the prefix must be followed
/// by whitespace or end-of-string.
pub fn prefix_to_pattern(prefix: &str) -> String {
    format!("^{}(\\s|$)", regex::escape(prefix.trim()))
}

/// Screen a raw pattern before compiling it.
///
/// Rejects overlong patterns and the classic catastrophic-backtracking
/// shape: an unbounded quantifier applied to a group that itself contains
/// one, e.g. `(a+)+`. The patterns come from configuration files and
/// runtime grants, so they are screened at the trust boundary even though
/// the engine underneath runs in linear time.
pub fn is_pattern_safe(pattern: &str) -> bool {
    pattern.len() <= MAX_PATTERN_LENGTH && !has_nested_unbounded_quantifier(pattern)
}

/// Screen and compile a pattern in one step.
pub fn compile_pattern(pattern: &str) -> Result<Regex, PatternError> {
    if !is_pattern_safe(pattern) {
        return Err(PatternError::Unsafe(pattern.to_string()));
    }
    Regex::new(pattern).map_err(|source| PatternError::Compile {
        pattern: pattern.to_string(),
        source,
    })
}

fn has_nested_unbounded_quantifier(pattern: &str) -> bool {
    // Per open group: does it contain an unbounded quantifier?
    let mut groups: Vec<bool> = Vec::new();
    // Set when the previous token was a closed group containing one.
    let mut closed_group_had_quantifier = false;
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                i += 2;
                closed_group_had_quantifier = false;
                continue;
            }
            '(' => {
                groups.push(false);
            }
            ')' => {
                let had = groups.pop().unwrap_or(false);
                if let Some(outer) = groups.last_mut() {
                    *outer = *outer || had;
                }
                closed_group_had_quantifier = had;
                i += 1;
                continue;
            }
            '*' | '+' => {
                if closed_group_had_quantifier {
                    return true;
                }
                if let Some(group) = groups.last_mut() {
                    *group = true;
                }
            }
            '{' => {
                // `{n,}` is unbounded; `{n}` and `{n,m}` are not
                let end = chars[i..].iter().position(|&c| c == '}');
                let unbounded = match end {
                    Some(offset) => {
                        let body: String = chars[i + 1..i + offset].iter().collect();
                        body.ends_with(',')
                    }
                    None => false,
                };
                if unbounded {
                    if closed_group_had_quantifier {
                        return true;
                    }
                    if let Some(group) = groups.last_mut() {
                        *group = true;
                    }
                }
                if let Some(offset) = end {
                    i += offset + 1;
                    closed_group_had_quantifier = false;
                    continue;
                }
            }
            _ => {}
        }
        closed_group_had_quantifier = false;
        i += 1;
    }

    false
}
