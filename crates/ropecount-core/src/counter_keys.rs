//! Canonical KV key names for segmented counters.
//!
//! This module is the single source of truth for counter key strings. All
//! readers and writers construct key names through [`KeyNames`] and recover
//! the identifying triple through [`parse_key_name`]; no hardcoded key
//! strings should exist outside this module.
//!
//! # Key Layout
//!
//! ```text
//! counter_set:{direction}:{segment}                pending member set
//! counter_set:{direction}:{segment}_processing     in-flight claim set
//! counters:{direction}:{segment}:{name}            one member's field counts
//! ```
//!
//! The layout is a stable contract: hash-map names written by one release
//! must parse under the next.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::segment::{Direction, Segment};

/// Suffix distinguishing the in-flight claim set from the pending set.
pub const PROCESSING_SUFFIX: &str = "_processing";

const HASH_PREFIX: &str = "counters";
const SET_PREFIX: &str = "counter_set";

/// Key name generator for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyNames {
    segment: Segment,
}

impl KeyNames {
    /// Returns the key names for the segment containing `t`.
    ///
    /// Deterministic: the same `t` always yields the same names.
    #[must_use]
    pub fn generate(t: DateTime<Utc>) -> Self {
        Self {
            segment: Segment::containing(t),
        }
    }

    /// Returns the key names for an explicit segment.
    #[must_use]
    pub const fn for_segment(segment: Segment) -> Self {
        Self { segment }
    }

    /// Returns the segment these names refer to.
    #[must_use]
    pub const fn segment(self) -> Segment {
        self.segment
    }

    /// Name of the set listing members pending compaction for `direction`.
    #[must_use]
    pub fn current_counter_set(self, direction: Direction) -> String {
        format!("{SET_PREFIX}:{direction}:{}", self.segment)
    }

    /// Name of the sibling set holding in-flight claims for `direction`.
    #[must_use]
    pub fn processing_set(self, direction: Direction) -> String {
        format!("{}{PROCESSING_SUFFIX}", self.current_counter_set(direction))
    }

    /// Name of the hash-map holding `member`'s field counts for `direction`.
    #[must_use]
    pub fn hash_set_name(self, direction: Direction, member: &str) -> String {
        format!("{HASH_PREFIX}:{direction}:{}:{member}", self.segment)
    }
}

/// The identifying triple recovered from a hash-map name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    /// The member name. Never empty.
    pub name: String,
    /// The counter direction.
    pub direction: Direction,
    /// The segment the counts belong to.
    pub segment: Segment,
}

/// Parses a hash-map name back into its identifying triple.
///
/// Inverse of [`KeyNames::hash_set_name`].
///
/// # Errors
///
/// Returns [`Error::Malformed`] when the string does not conform: wrong
/// prefix, unknown direction, non-numeric segment, or an empty name.
pub fn parse_key_name(raw: &str) -> Result<ParsedKey> {
    let mut parts = raw.splitn(4, ':');

    let prefix = parts.next().unwrap_or_default();
    if prefix != HASH_PREFIX {
        return Err(Error::malformed(format!(
            "expected {HASH_PREFIX:?} prefix in {raw:?}"
        )));
    }

    let direction: Direction = parts
        .next()
        .ok_or_else(|| Error::malformed(format!("missing direction in {raw:?}")))?
        .parse()?;

    let segment = parts
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .map(Segment::from_index)
        .ok_or_else(|| Error::malformed(format!("missing or non-numeric segment in {raw:?}")))?;

    let name = parts.next().unwrap_or_default();
    if name.is_empty() {
        return Err(Error::malformed(format!("empty name in {raw:?}")));
    }

    Ok(ParsedKey {
        name: name.to_string(),
        direction,
        segment,
    })
}
