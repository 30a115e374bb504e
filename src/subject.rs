//! Subject validation and wildcard matching.
//!
//! Subjects are dot-separated tokens (`orders.eu.created`). Subscribe
//! patterns may use `*` for exactly one token and `>` for one or more
//! trailing tokens. Publish subjects must be concrete.

/// Single-token wildcard.
pub const WILDCARD_ONE: &str = "*";

/// Trailing multi-token wildcard.
pub const WILDCARD_TAIL: &str = ">";

fn check_tokens(subject: &str) -> Result<(), String> {
    if subject.is_empty() {
        return Err("subject must not be empty".to_string());
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(format!("'{}' contains whitespace", subject));
    }
    if subject.split('.').any(str::is_empty) {
        return Err(format!("'{}' contains an empty token", subject));
    }
    Ok(())
}

/// Validate a subject that messages are published to.
pub fn validate_subject(subject: &str) -> Result<(), String> {
    check_tokens(subject)?;
    if subject.contains('*') || subject.contains('>') {
        return Err(format!("'{}' contains wildcard characters", subject));
    }
    Ok(())
}

/// Validate a subscribe pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    check_tokens(pattern)?;
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        let has_wildcard = token.contains('*') || token.contains('>');
        if !has_wildcard {
            continue;
        }
        if *token == WILDCARD_ONE {
            continue;
        }
        if *token == WILDCARD_TAIL && i == last {
            continue;
        }
        return Err(format!("'{}' has a misplaced wildcard in '{}'", pattern, token));
    }
    Ok(())
}

/// Check whether a concrete subject matches a (validated) pattern.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(WILDCARD_TAIL), Some(_)) => return true,
            (Some(WILDCARD_ONE), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
