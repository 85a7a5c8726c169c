//! Topic names and subscription filters.
//!
//! A [`Topic`] addresses a single message stream and is what `publish` accepts.
//! A [`TopicFilter`] may contain the `+` (single segment) and `#` (remaining
//! segments) wildcards and is what `subscribe` accepts. Both share the same
//! structural rules: non-empty, no leading or trailing `/`, no empty segments,
//! no NUL characters, and a byte length within the broker maximum.

use std::fmt;

use crate::error::ValidationError;

pub const TOPIC_DELIMITER: char = '/';

/// MQTT encodes topic lengths as u16.
pub const DEFAULT_MAX_TOPIC_LEN: usize = 65_535;

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

fn check_structure(raw: &str, max_len: usize) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if raw.len() > max_len {
        return Err(ValidationError::TopicTooLong {
            len: raw.len(),
            max: max_len,
        });
    }
    if raw.contains('\0') {
        return Err(ValidationError::InvalidCharacter(raw.to_string()));
    }
    if raw.starts_with(TOPIC_DELIMITER) || raw.ends_with(TOPIC_DELIMITER) {
        return Err(ValidationError::DelimiterEdge(raw.to_string()));
    }
    if raw.split(TOPIC_DELIMITER).any(str::is_empty) {
        return Err(ValidationError::EmptySegment(raw.to_string()));
    }
    Ok(())
}

/// A concrete topic name, valid for publishing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn parse(raw: impl Into<String>, max_len: usize) -> Result<Self, ValidationError> {
        let raw = raw.into();
        check_structure(&raw, max_len)?;
        if raw.contains(['+', '#']) {
            return Err(ValidationError::WildcardNotAllowed(raw));
        }
        Ok(Topic(raw))
    }

    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        Self::parse(raw, DEFAULT_MAX_TOPIC_LEN)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(TOPIC_DELIMITER)
    }

    /// Returns true if the topic lives under `prefix` (segment-wise).
    pub fn is_under(&self, prefix: &str) -> bool {
        self.0 == prefix
            || (self.0.starts_with(prefix)
                && self.0[prefix.len()..].starts_with(TOPIC_DELIMITER))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A subscription pattern, possibly containing wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn parse(raw: impl Into<String>, max_len: usize) -> Result<Self, ValidationError> {
        let raw = raw.into();
        check_structure(&raw, max_len)?;

        let segments: Vec<&str> = raw.split(TOPIC_DELIMITER).collect();
        let last = segments.len() - 1;
        for (index, segment) in segments.iter().enumerate() {
            let has_wildcard = segment.contains(['+', '#']);
            let whole_single = *segment == SINGLE_LEVEL;
            let whole_multi = *segment == MULTI_LEVEL && index == last;
            if has_wildcard && !whole_single && !whole_multi {
                return Err(ValidationError::MisplacedWildcard(raw.clone()));
            }
        }
        Ok(TopicFilter(raw))
    }

    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        Self::parse(raw, DEFAULT_MAX_TOPIC_LEN)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Standard MQTT matching: `+` matches one segment, a trailing `#` matches
    /// the parent and everything beneath it.
    pub fn matches(&self, topic: &Topic) -> bool {
        let mut pattern = self.0.split(TOPIC_DELIMITER);
        let mut name = topic.segments();
        loop {
            match (pattern.next(), name.next()) {
                (Some(MULTI_LEVEL), _) => return true,
                (Some(SINGLE_LEVEL), Some(_)) => continue,
                (Some(p), Some(n)) if p == n => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl From<Topic> for TopicFilter {
    fn from(topic: Topic) -> Self {
        TopicFilter(topic.0)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
