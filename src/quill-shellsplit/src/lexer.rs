//! Quote- and nesting-aware scanning over a raw command string.
//!
//! The scanner recognizes just enough POSIX/bash surface to split a
//! command safely: quoting, escapes, command/process substitution,
//! parameter expansion and subshell grouping. Everything else it cannot
//! account for is a hard error so the caller can fail closed.

use thiserror::Error;

/// Why a command string could not be decomposed.
///
/// Every variant means "we do not understand this command well enough to
/// vouch for it" - callers must treat all of them as unsafe/unknown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecomposeError {
    /// The command string was empty or whitespace.
    #[error("empty command")]
    Empty,

    /// A single or double quote was never closed.
    #[error("unbalanced quote")]
    UnbalancedQuote,

    /// A substitution or grouping delimiter was never closed (or closed
    /// without being opened).
    #[error("unbalanced `{0}`")]
    Unbalanced(&'static str),

    /// An operator had nothing on one of its sides, e.g. `a &&& b`.
    #[error("empty command segment next to `{0}`")]
    EmptySegment(&'static str),

    /// The command ended in the middle of an escape sequence.
    #[error("trailing backslash")]
    TrailingBackslash,

    /// Syntax the decomposer deliberately does not model (heredocs,
    /// arithmetic expansion, `case` patterns, ...).
    #[error("unsupported shell syntax: {0}")]
    Unsupported(&'static str),

    /// Substitution nesting exceeded the depth limit.
    #[error("command nesting exceeds depth limit")]
    TooDeep,
}

/// Nestable delimiters tracked while scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delim {
    /// `$(`, `<(`, `>(` or a bare `(` subshell, closed by `)`.
    Paren,
    /// `${`, closed by `}`.
    Brace,
    /// A backtick substitution, closed by the next backtick.
    Backtick,
}

fn matches_at(chars: &[char], i: usize, needle: &str) -> bool {
    needle.chars().enumerate().all(|(k, c)| chars.get(i + k) == Some(&c))
}

/// Split a command at its top-level operators (`;`, `&&`, `||`, `|`,
/// `|&`, background `&`), ignoring operators that are quoted or nested
/// inside a substitution.
///
/// A trailing `;` or `&` is legal; any other empty segment around an
/// operator is a syntax error. Returns one entry per side, in order.
pub(crate) fn split_top_level(input: &str) -> Result<Vec<String>, DecomposeError> {
    let chars: Vec<char> = input.chars().collect();
    let mut segments: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut stack: Vec<Delim> = Vec::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut last_op: Option<&'static str> = None;
    let mut i = 0;

    fn finalize(
        segments: &mut Vec<String>,
        current: &mut String,
        op: &'static str,
    ) -> Result<(), DecomposeError> {
        let segment = current.trim();
        if segment.is_empty() {
            return Err(DecomposeError::EmptySegment(op));
        }
        segments.push(segment.to_string());
        current.clear();
        Ok(())
    }

    while i < chars.len() {
        let c = chars[i];

        if in_single {
            current.push(c);
            if c == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }

        match c {
            '\\' => {
                if i + 1 >= chars.len() {
                    return Err(DecomposeError::TrailingBackslash);
                }
                current.push(c);
                current.push(chars[i + 1]);
                i += 2;
                continue;
            }
            '\'' if !in_double => {
                in_single = true;
                current.push(c);
            }
            '"' => {
                in_double = !in_double;
                current.push(c);
            }
            '`' => {
                if stack.last() == Some(&Delim::Backtick) {
                    stack.pop();
                } else {
                    stack.push(Delim::Backtick);
                }
                current.push(c);
            }
            '$' => {
                if matches_at(&chars, i, "$((") {
                    return Err(DecomposeError::Unsupported("arithmetic expansion"));
                }
                if matches_at(&chars, i, "$(") {
                    stack.push(Delim::Paren);
                    current.push_str("$(");
                    i += 2;
                    continue;
                }
                if matches_at(&chars, i, "${") {
                    stack.push(Delim::Brace);
                    current.push_str("${");
                    i += 2;
                    continue;
                }
                current.push(c);
            }
            '<' if !in_double => {
                if matches_at(&chars, i, "<<") {
                    return Err(DecomposeError::Unsupported("heredoc"));
                }
                if matches_at(&chars, i, "<(") {
                    stack.push(Delim::Paren);
                    current.push_str("<(");
                    i += 2;
                    continue;
                }
                if matches_at(&chars, i, "<&") {
                    current.push_str("<&");
                    i += 2;
                    continue;
                }
                current.push(c);
            }
            '>' if !in_double => {
                if matches_at(&chars, i, ">(") {
                    stack.push(Delim::Paren);
                    current.push_str(">(");
                    i += 2;
                    continue;
                }
                if matches_at(&chars, i, ">&") {
                    // fd duplication as in `2>&1`, not an operator
                    current.push_str(">&");
                    i += 2;
                    continue;
                }
                current.push(c);
            }
            '(' if !in_double => {
                stack.push(Delim::Paren);
                current.push(c);
            }
            ')' => {
                if stack.last() == Some(&Delim::Paren) {
                    stack.pop();
                    current.push(c);
                } else if in_double {
                    current.push(c);
                } else {
                    return Err(DecomposeError::Unbalanced(")"));
                }
            }
            '}' => {
                if stack.last() == Some(&Delim::Brace) {
                    stack.pop();
                }
                current.push(c);
            }
            '&' if stack.is_empty() && !in_double => {
                if matches_at(&chars, i, "&&") {
                    finalize(&mut segments, &mut current, "&&")?;
                    last_op = Some("&&");
                    i += 2;
                    continue;
                }
                if matches_at(&chars, i, "&>") {
                    // redirection, not an operator
                    current.push_str("&>");
                    i += 2;
                    continue;
                }
                finalize(&mut segments, &mut current, "&")?;
                last_op = Some("&");
                i += 1;
                continue;
            }
            '|' if stack.is_empty() && !in_double => {
                let op = if matches_at(&chars, i, "||") {
                    "||"
                } else if matches_at(&chars, i, "|&") {
                    "|&"
                } else {
                    "|"
                };
                finalize(&mut segments, &mut current, op)?;
                last_op = Some(op);
                i += op.len();
                continue;
            }
            ';' if stack.is_empty() && !in_double => {
                if matches_at(&chars, i, ";;") {
                    return Err(DecomposeError::Unsupported("`;;`"));
                }
                finalize(&mut segments, &mut current, ";")?;
                last_op = Some(";");
                i += 1;
                continue;
            }
            _ => current.push(c),
        }
        i += 1;
    }

    if in_single || in_double {
        return Err(DecomposeError::UnbalancedQuote);
    }
    if let Some(open) = stack.last() {
        return Err(DecomposeError::Unbalanced(match open {
            Delim::Paren => "(",
            Delim::Brace => "${",
            Delim::Backtick => "`",
        }));
    }

    let tail = current.trim();
    if tail.is_empty() {
        // `ls;` and `sleep 5 &` end in a terminator, which is fine; a
        // dangling `&&`, `||` or `|` is not.
        match last_op {
            None | Some(";") | Some("&") => {}
            Some(op) => return Err(DecomposeError::EmptySegment(op)),
        }
    } else {
        segments.push(tail.to_string());
    }

    Ok(segments)
}

/// Extract the body of every outermost command/process substitution:
/// `$(...)`, backticks, `<(...)` and `>(...)`.
///
/// Bodies nested inside another substitution are left alone - the caller
/// recurses on each returned body and finds them there. Assumes the input
/// already passed [`split_top_level`], so balance errors are defensive.
pub(crate) fn extract_substitutions(input: &str) -> Result<Vec<String>, DecomposeError> {
    let chars: Vec<char> = input.chars().collect();
    let mut out: Vec<String> = Vec::new();
    // (delimiter, capture start) - capture is None when the opener is not
    // a substitution or is already inside a captured body
    let mut stack: Vec<(Delim, Option<usize>)> = Vec::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    fn capture_start(stack: &[(Delim, Option<usize>)], start: usize) -> Option<usize> {
        if stack.iter().any(|(_, cap)| cap.is_some()) {
            None
        } else {
            Some(start)
        }
    }

    while i < chars.len() {
        let c = chars[i];

        if in_single {
            if c == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }

        match c {
            '\\' => {
                if i + 1 >= chars.len() {
                    return Err(DecomposeError::TrailingBackslash);
                }
                i += 2;
                continue;
            }
            '\'' if !in_double => in_single = true,
            '"' => in_double = !in_double,
            '`' => {
                if stack.last().map(|(d, _)| *d) == Some(Delim::Backtick) {
                    if let Some((_, Some(start))) = stack.pop() {
                        out.push(chars[start..i].iter().collect::<String>().trim().to_string());
                    }
                } else {
                    let cap = capture_start(&stack, i + 1);
                    stack.push((Delim::Backtick, cap));
                }
            }
            '$' => {
                if matches_at(&chars, i, "$((") {
                    return Err(DecomposeError::Unsupported("arithmetic expansion"));
                }
                if matches_at(&chars, i, "$(") {
                    let cap = capture_start(&stack, i + 2);
                    stack.push((Delim::Paren, cap));
                    i += 2;
                    continue;
                }
                if matches_at(&chars, i, "${") {
                    stack.push((Delim::Brace, None));
                    i += 2;
                    continue;
                }
            }
            '<' | '>' if !in_double => {
                if matches_at(&chars, i, "<(") || matches_at(&chars, i, ">(") {
                    let cap = capture_start(&stack, i + 2);
                    stack.push((Delim::Paren, cap));
                    i += 2;
                    continue;
                }
            }
            '(' if !in_double => stack.push((Delim::Paren, None)),
            ')' => {
                if stack.last().map(|(d, _)| *d) == Some(Delim::Paren) {
                    if let Some((_, Some(start))) = stack.pop() {
                        out.push(chars[start..i].iter().collect::<String>().trim().to_string());
                    }
                } else if !in_double {
                    return Err(DecomposeError::Unbalanced(")"));
                }
            }
            '}' => {
                if stack.last().map(|(d, _)| *d) == Some(Delim::Brace) {
                    stack.pop();
                }
            }
            _ => {}
        }
        i += 1;
    }

    if in_single || in_double {
        return Err(DecomposeError::UnbalancedQuote);
    }
    if !stack.is_empty() {
        return Err(DecomposeError::Unbalanced("("));
    }

    out.retain(|body| !body.is_empty());
    Ok(out)
}

/// Whether the command contains an unquoted redirection operator.
///
/// Process substitution (`<(`, `>(`) is not redirection and is skipped.
pub(crate) fn detect_redirection(input: &str) -> bool {
    let chars: Vec<char> = input.chars().collect();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_single {
            if c == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }

        match c {
            '\\' => {
                i += 2;
                continue;
            }
            '\'' if !in_double => in_single = true,
            '"' => in_double = !in_double,
            '<' | '>' if !in_double => {
                if chars.get(i + 1) == Some(&'(') {
                    i += 2;
                    continue;
                }
                return true;
            }
            _ => {}
        }
        i += 1;
    }

    false
}
