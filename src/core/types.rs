//! Core identifier and time-slice types for the scheduler.
//!
//! These types provide type-safe identifiers for jobs and nodes, and the
//! fixed-width `TimeSlice` buckets that job due-times are indexed by.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Default width of a time slice.
pub const DEFAULT_SLICE_WIDTH: Duration = Duration::from_secs(60);

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

/// Identifier of a scheduler node, used as the owner value for locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

/// A fixed-width interval bucketing job due-times.
///
/// A slice is identified by its start instant, which is always aligned to the
/// slice width (counted from the Unix epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeSlice(DateTime<Utc>);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a JobId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl NodeId {
    /// Create a new NodeId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random node identifier.
    pub fn random() -> Self {
        Self(format!("node-{}", Uuid::new_v4()))
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

fn width_millis(width: Duration) -> i64 {
    (width.as_millis() as i64).max(1)
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

impl TimeSlice {
    /// The slice that contains `instant` (floor to the slice width).
    pub fn containing(instant: DateTime<Utc>, width: Duration) -> Self {
        let w = width_millis(width);
        let floored = instant.timestamp_millis().div_euclid(w) * w;
        Self(from_millis(floored).unwrap_or(instant))
    }

    /// The first slice starting at or after `instant` (ceil to the slice width).
    pub fn ceil(instant: DateTime<Utc>, width: Duration) -> Self {
        let floor = Self::containing(instant, width);
        if floor.0 == instant {
            floor
        } else {
            floor.next(width)
        }
    }

    /// Build a slice from epoch milliseconds, aligning down to the width.
    pub fn from_timestamp_millis(millis: i64, width: Duration) -> Option<Self> {
        from_millis(millis).map(|t| Self::containing(t, width))
    }

    /// Rebuild a slice from the epoch milliseconds of its start.
    ///
    /// The value must already be aligned, as it is when read back from storage.
    pub fn from_start_millis(millis: i64) -> Option<Self> {
        from_millis(millis).map(Self)
    }

    /// Whether `instant` falls exactly on a slice boundary.
    pub fn is_aligned(instant: DateTime<Utc>, width: Duration) -> bool {
        instant.timestamp_millis().rem_euclid(width_millis(width)) == 0
    }

    /// Start instant of the slice.
    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }

    /// Start instant as epoch milliseconds.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// The slice immediately after this one.
    pub fn next(&self, width: Duration) -> Self {
        self.offset(1, width)
    }

    /// The slice immediately before this one.
    pub fn prev(&self, width: Duration) -> Self {
        self.offset(-1, width)
    }

    /// The slice `n` widths away from this one.
    pub fn offset(&self, n: i64, width: Duration) -> Self {
        let millis = self.0.timestamp_millis() + n * width_millis(width);
        Self(from_millis(millis).unwrap_or(self.0))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TimeSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%SZ"))
    }
}
