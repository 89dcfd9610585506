//! Topic name and filter validation
//!
//! A topic name is what a PUBLISH carries; a filter is what a SUBSCRIBE
//! asks for and may use `+` (one level) and `#` (this level and all below,
//! last level only). Topics starting with `$` are not matched by a filter
//! that starts with a wildcard.

use std::fmt;

/// Longest topic an MQTT string can encode
const MAX_TOPIC_BYTES: usize = u16::MAX as usize;

/// Why a topic name or filter was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    Empty,
    TooLong,
    NullCharacter,
    /// `+` or `#` in a topic name
    WildcardInName,
    /// More levels than the configured limit
    TooManyLevels(usize),
    /// `#` mixed with other characters or not in the last level
    MisplacedMultiLevel,
    /// `+` mixed with other characters in its level
    MisplacedSingleLevel,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty"),
            Self::TooLong => write!(f, "longer than {} bytes", MAX_TOPIC_BYTES),
            Self::NullCharacter => f.write_str("contains U+0000"),
            Self::WildcardInName => f.write_str("wildcard in topic name"),
            Self::TooManyLevels(max) => write!(f, "more than {} levels", max),
            Self::MisplacedMultiLevel => f.write_str("'#' must be the whole last level"),
            Self::MisplacedSingleLevel => f.write_str("'+' must be a whole level"),
        }
    }
}

impl std::error::Error for TopicError {}

fn check_common(topic: &str, max_levels: usize) -> Result<(), TopicError> {
    if topic.is_empty() {
        Err(TopicError::Empty)
    } else if topic.len() > MAX_TOPIC_BYTES {
        Err(TopicError::TooLong)
    } else if topic.contains('\0') {
        Err(TopicError::NullCharacter)
    } else if max_levels > 0 && topic.split('/').nth(max_levels).is_some() {
        Err(TopicError::TooManyLevels(max_levels))
    } else {
        Ok(())
    }
}

/// Validate a PUBLISH topic name. `max_levels` of 0 means no limit.
pub fn validate_topic_name(topic: &str, max_levels: usize) -> Result<(), TopicError> {
    check_common(topic, max_levels)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName);
    }
    Ok(())
}

/// Validate a SUBSCRIBE / UNSUBSCRIBE filter. `max_levels` of 0 means no limit.
pub fn validate_topic_filter(filter: &str, max_levels: usize) -> Result<(), TopicError> {
    check_common(filter, max_levels)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => return Err(TopicError::MisplacedMultiLevel),
            "#" | "+" => {}
            _ if level.contains('#') => return Err(TopicError::MisplacedMultiLevel),
            _ if level.contains('+') => return Err(TopicError::MisplacedSingleLevel),
            _ => {}
        }
    }
    Ok(())
}

/// Whether `filter` selects `topic`; empty input on either side matches nothing
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.is_empty() || filter.is_empty() {
        return false;
    }
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut names = topic.split('/');
    let mut wanted = filter.split('/');
    loop {
        match (wanted.next(), names.next()) {
            // "a/#" also selects "a"
            (Some("#"), _) => return true,
            (Some(want), Some(name)) if want == "+" || want == name => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
