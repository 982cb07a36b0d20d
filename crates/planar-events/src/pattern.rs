//! Compiled glob patterns over dotted event names.
//!
//! Grammar: segments separated by `.`; a segment is a literal, a `*`
//! (matches exactly one segment), or a trailing `**` (matches any
//! remaining suffix). `**` is only valid as the final segment. A segment
//! may also mix a literal prefix with a trailing `*` (`transport_*`),
//! which the mover event family uses.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Segment {
    /// Exact segment text.
    Literal(String),
    /// `foo*`: literal prefix, any tail within the segment.
    Prefix(String),
    /// `*`: any single segment.
    Any,
}

impl Segment {
    fn matches(&self, text: &str) -> bool {
        match self {
            Self::Literal(lit) => lit == text,
            Self::Prefix(prefix) => text.starts_with(prefix),
            Self::Any => true,
        }
    }
}

/// A compiled subscription pattern.
///
/// Compiled once at registration (spec'd as a matcher rather than a
/// per-publish string scan); matching is a single walk over the event
/// name's segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    source: String,
    segments: Vec<Segment>,
    /// Whether the pattern ends in `**`.
    open_suffix: bool,
}

impl Pattern {
    /// Compile a dotted glob pattern.
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::invalid_pattern(pattern, "pattern must not be empty"));
        }

        let raw: Vec<&str> = pattern.split('.').collect();
        let mut segments = Vec::with_capacity(raw.len());
        let mut open_suffix = false;

        for (index, part) in raw.iter().enumerate() {
            let last = index == raw.len() - 1;
            match *part {
                "" => {
                    return Err(Error::invalid_pattern(pattern, "empty segment"));
                }
                "**" => {
                    if !last {
                        return Err(Error::invalid_pattern(
                            pattern,
                            "'**' is only valid as the final segment",
                        ));
                    }
                    open_suffix = true;
                }
                "*" => segments.push(Segment::Any),
                text if text.contains("**") => {
                    return Err(Error::invalid_pattern(
                        pattern,
                        "'**' cannot be combined with other characters",
                    ));
                }
                text => match text.strip_suffix('*') {
                    Some(prefix) if prefix.contains('*') => {
                        return Err(Error::invalid_pattern(
                            pattern,
                            "'*' is only valid alone or as a segment suffix",
                        ));
                    }
                    Some(prefix) => segments.push(Segment::Prefix(prefix.to_string())),
                    None if text.contains('*') => {
                        return Err(Error::invalid_pattern(
                            pattern,
                            "'*' is only valid alone or as a segment suffix",
                        ));
                    }
                    None => segments.push(Segment::Literal(text.to_string())),
                },
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
            open_suffix,
        })
    }

    /// The original pattern text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a dotted event name.
    pub fn matches_name(&self, name: &str) -> bool {
        let parts: Vec<&str> = name.split('.').collect();

        if self.open_suffix {
            if parts.len() < self.segments.len() {
                return false;
            }
        } else if parts.len() != self.segments.len() {
            return false;
        }

        self.segments
            .iter()
            .zip(parts.iter())
            .all(|(segment, part)| segment.matches(part))
    }

    /// Match an event by its type name.
    pub fn matches(&self, event: &Event) -> bool {
        self.matches_name(&event.event_type)
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::str::FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::compile(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, name: &str) -> bool {
        Pattern::compile(pattern).map(|p| p.matches_name(name)) == Ok(true)
    }

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(matches("plate.created", "plate.created"));
        assert!(!matches("plate.created", "plate.error"));
        assert!(!matches("plate.created", "plate.created.extra"));
    }

    #[test]
    fn star_matches_one_segment() {
        assert!(matches("plate.*", "plate.created"));
        assert!(matches("plate.*", "plate.error"));
        assert!(!matches("plate.*", "mover.assigned"));
        assert!(!matches("plate.*", "plate.step.completed"));
        assert!(matches("*.error", "device.error"));
    }

    #[test]
    fn prefix_star_matches_within_segment() {
        assert!(matches("mover.transport_*", "mover.transport_started"));
        assert!(matches("mover.transport_*", "mover.transport_failed"));
        assert!(!matches("mover.transport_*", "mover.position_changed"));
    }

    #[test]
    fn double_star_matches_any_suffix() {
        assert!(matches("**", "plate.created"));
        assert!(matches("**", "a.b.c.d"));
        assert!(matches("plate.**", "plate.step_completed"));
        assert!(!matches("plate.**", "mover.assigned"));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(Pattern::compile("").is_err());
        assert!(Pattern::compile("plate..created").is_err());
        assert!(Pattern::compile("**.plate").is_err());
        assert!(Pattern::compile("pla**te.x").is_err());
        assert!(Pattern::compile("pl*ate.x").is_err());
    }
}
