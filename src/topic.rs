//! Topic-exchange routing key patterns
//!
//! Keys are dot-delimited words (`zalo.message.received`). Binding patterns may
//! use `*` for exactly one word and `#` for zero or more words.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,

    #[error("pattern has an empty word at position {0}")]
    EmptyWord(usize),

    #[error("wildcard must occupy a whole word, found '{0}'")]
    PartialWildcard(String),
}

/// Check that a binding pattern is well formed
pub fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    if pattern.is_empty() {
        return Err(PatternError::Empty);
    }
    for (idx, word) in pattern.split('.').enumerate() {
        if word.is_empty() {
            return Err(PatternError::EmptyWord(idx));
        }
        if word != "*" && word != "#" && (word.contains('*') || word.contains('#')) {
            return Err(PatternError::PartialWildcard(word.to_string()));
        }
    }
    Ok(())
}

/// Does `routing_key` match the binding `pattern`?
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

/// Does `routing_key` match any of the binding patterns?
pub fn matches_any<S: AsRef<str>>(patterns: &[S], routing_key: &str) -> bool {
    patterns.iter().any(|p| matches(p.as_ref(), routing_key))
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
