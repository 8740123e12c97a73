//! Time segments and counter directions.
//!
//! Upstream writers partition counter increments into fixed-width time
//! buckets. The compactor only ever touches buckets that are guaranteed
//! closed, so the bucket arithmetic here is the sole authority on what
//! "closed" means.

use chrono::{DateTime, Utc};

use crate::error::Error;

/// Width of one segment in seconds.
pub const SEGMENT_DURATION_SECS: i64 = 600;

/// A fixed-width time bucket, identified by its index on the epoch.
///
/// The segment containing a time `t` is `floor(unix(t) / width)`. Indices
/// are totally ordered, so "older than" is plain integer comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment(i64);

impl Segment {
    /// Returns the segment containing `t`.
    #[must_use]
    pub fn containing(t: DateTime<Utc>) -> Self {
        Self(t.timestamp().div_euclid(SEGMENT_DURATION_SECS))
    }

    /// Returns the most recent segment guaranteed closed at `start_at`.
    ///
    /// The bucket containing `start_at` may still receive writes; every
    /// earlier bucket is closed.
    #[must_use]
    pub fn last_processible(start_at: DateTime<Utc>) -> Self {
        Self::containing(start_at).prev()
    }

    /// Builds a segment from a raw bucket index.
    #[must_use]
    pub const fn from_index(index: i64) -> Self {
        Self(index)
    }

    /// Returns the raw bucket index.
    #[must_use]
    pub const fn index(self) -> i64 {
        self.0
    }

    /// Returns the inclusive start time of this segment.
    #[must_use]
    pub fn start_time(self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0 * SEGMENT_DURATION_SECS, 0).unwrap_or_default()
    }

    /// Returns the segment immediately before this one.
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0 - 1)
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Counter polarity.
///
/// Segments and directions are independent dimensions: each segment holds
/// one counter set per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outbound counters.
    Src,
    /// Inbound counters.
    Dst,
}

impl Direction {
    /// Returns the string name for this direction.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Src => "src",
            Self::Dst => "dst",
        }
    }

    /// Returns both directions.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Src, Self::Dst]
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "src" => Ok(Self::Src),
            "dst" => Ok(Self::Dst),
            other => Err(Error::malformed(format!("unknown direction {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    #[test]
    fn containing_floors_to_bucket() {
        assert_eq!(Segment::containing(at(0)).index(), 0);
        assert_eq!(Segment::containing(at(SEGMENT_DURATION_SECS - 1)).index(), 0);
        assert_eq!(Segment::containing(at(SEGMENT_DURATION_SECS)).index(), 1);
        assert_eq!(Segment::containing(at(SEGMENT_DURATION_SECS * 7 + 42)).index(), 7);
    }

    #[test]
    fn containing_floors_before_epoch() {
        // div_euclid, not integer division: times before the epoch still
        // land in the bucket that starts at or before them.
        assert_eq!(Segment::containing(at(-1)).index(), -1);
        assert_eq!(Segment::containing(at(-SEGMENT_DURATION_SECS)).index(), -1);
    }

    #[test]
    fn start_time_round_trips() {
        let seg = Segment::from_index(123);
        assert_eq!(Segment::containing(seg.start_time()), seg);
        assert_eq!(seg.start_time().timestamp(), 123 * SEGMENT_DURATION_SECS);
    }

    #[test]
    fn last_processible_is_strictly_before_start() {
        // Mid-bucket: the containing bucket is open, its predecessor closed.
        let t = at(SEGMENT_DURATION_SECS * 10 + 17);
        assert_eq!(Segment::last_processible(t).index(), 9);

        // Exactly on a boundary the new bucket has just opened.
        let boundary = at(SEGMENT_DURATION_SECS * 10);
        assert_eq!(Segment::last_processible(boundary).index(), 9);
    }

    #[test]
    fn prev_decrements() {
        assert_eq!(Segment::from_index(5).prev(), Segment::from_index(4));
    }

    #[test]
    fn direction_round_trips_through_str() {
        for dir in Direction::all() {
            assert_eq!(dir.as_str().parse::<Direction>().ok(), Some(*dir));
        }
        assert!("upstream".parse::<Direction>().is_err());
    }
}
