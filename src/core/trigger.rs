//! Triggers describe when a job is due and whether it recurs.
//!
//! Only two recurrence rules exist: a single execution, and a fixed-interval
//! repetition. Trigger times are always aligned to the slice width so that a
//! trigger maps onto exactly one time slice.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::types::TimeSlice;

/// Errors that can occur when building or validating triggers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    /// Trigger time does not fall on a slice boundary.
    #[error("trigger time {0} is not aligned to the slice width")]
    Misaligned(DateTime<Utc>),

    /// Invalid repeat interval.
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Invalid repeat limit.
    #[error("repeat limit must be greater than zero")]
    InvalidRepeatLimit,

    /// Invalid duration expression.
    #[error("invalid duration expression: {0}")]
    InvalidDuration(String),
}

/// Rule for when a job becomes due and whether it recurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires once at `trigger_time`.
    SingleExecution { trigger_time: DateTime<Utc> },

    /// Fires at `trigger_time`, then re-arms every `interval`.
    Repeating {
        trigger_time: DateTime<Utc>,
        #[serde(rename = "interval_ms", with = "serde_duration")]
        interval: Duration,
        /// Total number of executions allowed (`None` = indefinitely).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repeat_limit: Option<u32>,
        /// Executions completed so far.
        #[serde(default)]
        execution_count: u32,
    },
}

impl Trigger {
    /// Single execution in the first slice starting at or after `time`.
    pub fn single_at(time: DateTime<Utc>, width: Duration) -> Self {
        Trigger::SingleExecution {
            trigger_time: TimeSlice::ceil(time, width).start(),
        }
    }

    /// Single execution `delay` after `now`, aligned up to the slice width.
    pub fn single_after(now: DateTime<Utc>, delay: Duration, width: Duration) -> Self {
        let due = now
            .checked_add_signed(to_delta(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::single_at(due, width)
    }

    /// Repeating trigger starting at `start` (aligned up) every `interval`.
    ///
    /// The interval must be a positive multiple of the slice width.
    pub fn repeating(
        start: DateTime<Utc>,
        interval: Duration,
        width: Duration,
    ) -> Result<Self, TriggerError> {
        check_interval(interval, width)?;
        let trigger_time = TimeSlice::ceil(start, width).start();
        check_rearm(trigger_time, interval)?;
        Ok(Trigger::Repeating {
            trigger_time,
            interval,
            repeat_limit: None,
            execution_count: 0,
        })
    }

    /// Limit a repeating trigger to `limit` executions in total.
    ///
    /// Has no effect on a single-execution trigger.
    pub fn with_repeat_limit(self, limit: u32) -> Result<Self, TriggerError> {
        if limit == 0 {
            return Err(TriggerError::InvalidRepeatLimit);
        }
        Ok(match self {
            Trigger::Repeating {
                trigger_time,
                interval,
                execution_count,
                ..
            } => Trigger::Repeating {
                trigger_time,
                interval,
                repeat_limit: Some(limit),
                execution_count,
            },
            single => single,
        })
    }

    /// When the trigger is due.
    pub fn trigger_time(&self) -> DateTime<Utc> {
        match self {
            Trigger::SingleExecution { trigger_time } => *trigger_time,
            Trigger::Repeating { trigger_time, .. } => *trigger_time,
        }
    }

    /// The slice this trigger is indexed under.
    pub fn time_slice(&self, width: Duration) -> TimeSlice {
        TimeSlice::containing(self.trigger_time(), width)
    }

    /// Whether this trigger recurs.
    pub fn is_repeating(&self) -> bool {
        matches!(self, Trigger::Repeating { .. })
    }

    /// Check the trigger invariants against a slice width.
    pub fn validate(&self, width: Duration) -> Result<(), TriggerError> {
        if !TimeSlice::is_aligned(self.trigger_time(), width) {
            return Err(TriggerError::Misaligned(self.trigger_time()));
        }
        if let Trigger::Repeating {
            trigger_time,
            interval,
            repeat_limit,
            ..
        } = self
        {
            check_interval(*interval, width)?;
            check_rearm(*trigger_time, *interval)?;
            if *repeat_limit == Some(0) {
                return Err(TriggerError::InvalidRepeatLimit);
            }
        }
        Ok(())
    }

    /// The trigger for the next execution after this one fired.
    ///
    /// Returns `None` for a single execution or an exhausted repeat limit.
    /// Occurrences that already lie in or before the slice containing `now`
    /// are skipped, so a node catching up fires a repeating job once rather
    /// than once per missed occurrence. A next occurrence that falls outside
    /// the representable time range also ends the series.
    pub fn next_trigger(&self, now: DateTime<Utc>, width: Duration) -> Option<Trigger> {
        let Trigger::Repeating {
            trigger_time,
            interval,
            repeat_limit,
            execution_count,
        } = self
        else {
            return None;
        };

        let executions = execution_count.saturating_add(1);
        if repeat_limit.is_some_and(|limit| executions >= limit) {
            return None;
        }

        let step = to_delta(*interval);
        let step_ms = step.num_milliseconds();
        if step_ms <= 0 {
            return None;
        }

        let current = TimeSlice::containing(now, width).start();
        let mut next = trigger_time.checked_add_signed(step)?;
        if next <= current {
            let behind = (current - *trigger_time).num_milliseconds();
            let offset = (behind / step_ms).checked_add(1)?.checked_mul(step_ms)?;
            next = trigger_time.checked_add_signed(TimeDelta::try_milliseconds(offset)?)?;
            while next <= current {
                next = next.checked_add_signed(step)?;
            }
        }

        Some(Trigger::Repeating {
            trigger_time: next,
            interval: *interval,
            repeat_limit: *repeat_limit,
            execution_count: executions,
        })
    }
}

fn check_interval(interval: Duration, width: Duration) -> Result<(), TriggerError> {
    if interval.is_zero() {
        return Err(TriggerError::InvalidInterval("interval must be positive".into()));
    }
    let width_ms = width.as_millis().max(1);
    if interval.as_millis() % width_ms != 0 {
        return Err(TriggerError::InvalidInterval(format!(
            "{:?} is not a multiple of the slice width {:?}",
            interval, width
        )));
    }
    Ok(())
}

fn check_rearm(trigger_time: DateTime<Utc>, interval: Duration) -> Result<(), TriggerError> {
    match trigger_time.checked_add_signed(to_delta(interval)) {
        Some(_) => Ok(()),
        None => Err(TriggerError::InvalidInterval(format!(
            "{:?} after {} is out of range",
            interval, trigger_time
        ))),
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Parse a duration string like "5m", "1h", "1h30m", "30s", "2d".
pub fn parse_duration(s: &str) -> Result<Duration, TriggerError> {
    let s = s.trim();
    let mut total_secs: u64 = 0;
    let mut current_num = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
        } else {
            let num: u64 = current_num
                .parse()
                .map_err(|_| TriggerError::InvalidDuration(s.to_string()))?;
            current_num.clear();

            let unit = match c {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                'd' => 86400,
                _ => return Err(TriggerError::InvalidDuration(s.to_string())),
            };
            total_secs = num
                .checked_mul(unit)
                .and_then(|v| total_secs.checked_add(v))
                .ok_or_else(|| TriggerError::InvalidDuration(s.to_string()))?;
        }
    }

    // trailing digits without a unit
    if !current_num.is_empty() || total_secs == 0 {
        return Err(TriggerError::InvalidDuration(s.to_string()));
    }

    Ok(Duration::from_secs(total_secs))
}

/// Serde helper for Duration serialization as milliseconds.
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
