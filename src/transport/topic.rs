//! Subject and Pattern Rules
//!
//! Subjects are dot-separated tokens (e.g. `orders.eu.created`). Subscription
//! patterns may additionally use two wildcards:
//! - `*` matches exactly one token (`orders.*.created`)
//! - `>` matches one or more trailing tokens and must be last (`orders.>`)

/// Single-token wildcard
pub const SINGLE_WILDCARD: &str = "*";

/// Multi-token suffix wildcard
pub const TAIL_WILDCARD: &str = ">";

/// Why a subject or pattern was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("Subject is empty")]
    Empty,

    #[error("Subject contains an empty token: {0}")]
    EmptyToken(String),

    #[error("Subject contains whitespace: {0}")]
    Whitespace(String),

    #[error("Wildcards are not allowed when publishing: {0}")]
    WildcardInSubject(String),

    #[error("'>' must be the last token: {0}")]
    TailNotLast(String),
}

fn check_tokens(value: &str) -> Result<(), TopicError> {
    if value.is_empty() {
        return Err(TopicError::Empty);
    }
    if value.chars().any(char::is_whitespace) {
        return Err(TopicError::Whitespace(value.to_string()));
    }
    if value.split('.').any(str::is_empty) {
        return Err(TopicError::EmptyToken(value.to_string()));
    }
    Ok(())
}

/// Validate a concrete subject used for publishing
pub fn validate_subject(subject: &str) -> Result<(), TopicError> {
    check_tokens(subject)?;
    if subject
        .split('.')
        .any(|t| t == SINGLE_WILDCARD || t == TAIL_WILDCARD)
    {
        return Err(TopicError::WildcardInSubject(subject.to_string()));
    }
    Ok(())
}

/// Validate a subscription pattern
pub fn validate_pattern(pattern: &str) -> Result<(), TopicError> {
    check_tokens(pattern)?;
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;
    if tokens[..last].iter().any(|t| *t == TAIL_WILDCARD) {
        return Err(TopicError::TailNotLast(pattern.to_string()));
    }
    Ok(())
}

/// Check whether `subject` is routed to a subscription on `pattern`
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');

    for token in pattern.split('.') {
        match token {
            TAIL_WILDCARD => return subject_tokens.next().is_some(),
            SINGLE_WILDCARD => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => match subject_tokens.next() {
                Some(s) if s == literal => {}
                _ => return false,
            },
        }
    }

    subject_tokens.next().is_none()
}
