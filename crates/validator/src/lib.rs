//! Command validator (C1).
//!
//! Accepts only commands whose head token is in a fixed allowlist and whose
//! tokens contain no shell metacharacters. No shell is ever invoked to parse
//! or run the result — the output is a plain argv, exec'd directly by the
//! sandbox manager (C2).

use thiserror::Error;

pub type Argv = Vec<String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("command contains a forbidden shell metacharacter")]
    ForbiddenPattern,
    #[error("command is empty")]
    EmptyCommand,
    #[error("command '{0}' is not in the allowlist")]
    NotAllowed(String),
    #[error("{0} invocation must be exactly '{0} -c <script>'")]
    BadShellForm(String),
}

/// Fixed allowlist of permitted head commands (§4.1). Compile-time constant:
/// nothing in config widens or narrows this set.
const ALLOWLIST: &[&str] = &[
    // file inspection
    "ls", "cat", "head", "tail", "wc", "file", "stat",
    // text processing
    "grep", "sed", "awk", "sort", "uniq", "cut", "tr",
    // traversal
    "find", "pwd", "echo",
    // mutation within the workspace
    "mkdir", "touch", "cp", "mv", "rm",
    // shell escape hatch — restricted in validate_shell_form below
    "sh", "bash",
];

const FORBIDDEN_CHARS: &[char] = &['|', '&', ';', '>', '<', '`', '\n', '\r'];

/// Runs on the raw string, before tokenisation, so a quoted metacharacter
/// (`"ls|grep"`) can't sneak past a lenient tokeniser.
fn has_forbidden_pattern(s: &str) -> bool {
    s.chars().any(|c| FORBIDDEN_CHARS.contains(&c)) || s.contains("$(") || s.contains("${")
}

/// Validate a single command string, returning its argv or a rejection
/// reason. Pure function — identical input always yields identical output.
pub fn validate(command: &str) -> Result<Argv, ValidationError> {
    if has_forbidden_pattern(command) {
        return Err(ValidationError::ForbiddenPattern);
    }

    let tokens = tokenize(command);
    let head = tokens.first().ok_or(ValidationError::EmptyCommand)?;

    if !ALLOWLIST.contains(&head.as_str()) {
        return Err(ValidationError::NotAllowed(head.clone()));
    }

    if head == "sh" || head == "bash" {
        validate_shell_form(head, &tokens)?;
    }

    Ok(tokens)
}

/// `sh -c <script>` is permitted only for a *simple* script: exactly two
/// trailing tokens, the script itself re-checked for forbidden patterns and
/// its own head checked against the allowlist. This preserves the calling
/// convention some tools expect while defeating the point of a real shell.
fn validate_shell_form(head: &str, tokens: &[String]) -> Result<(), ValidationError> {
    if tokens.len() != 3 || tokens[1] != "-c" {
        return Err(ValidationError::BadShellForm(head.to_string()));
    }
    let script = &tokens[2];
    if has_forbidden_pattern(script) {
        return Err(ValidationError::ForbiddenPattern);
    }

    let inner = tokenize(script);
    let inner_head = inner.first().ok_or(ValidationError::EmptyCommand)?;
    if !ALLOWLIST.contains(&inner_head.as_str()) {
        return Err(ValidationError::NotAllowed(inner_head.clone()));
    }
    Ok(())
}

/// POSIX-ish shell word-splitting. Single quotes are literal; double quotes
/// allow backslash-escaping of `"` and `\`; otherwise whitespace separates
/// tokens. No globbing, no variable expansion, no command substitution — any
/// of those sigils would already have been rejected by `has_forbidden_pattern`.
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') | None => break,
                        Some('\\') => match chars.peek() {
                            Some('"') | Some('\\') => current.push(chars.next().unwrap()),
                            _ => current.push('\\'),
                        },
                        Some(c) => current.push(c),
                    }
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}
