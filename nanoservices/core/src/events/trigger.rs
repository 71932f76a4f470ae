use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Days, Utc};

/// What starts a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Run on a fixed interval
    Interval(Duration),
    /// Run once a day, at midnight UTC
    Daily,
    /// Run only when requested
    Manual,
}

impl Trigger {
    /// Time between scheduled runs, if the trigger is periodic.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Trigger::Interval(every) => Some(*every),
            Trigger::Daily => Some(Duration::from_secs(24 * 60 * 60)),
            Trigger::Manual => None,
        }
    }

    /// Wait before the first scheduled run, measured from `now`. Intervals
    /// start one period out; daily runs line up with the next UTC midnight.
    pub fn first_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Trigger::Daily => Some(until_next_midnight(now)),
            other => other.period(),
        }
    }
}

fn until_next_midnight(now: DateTime<Utc>) -> Duration {
    let midnight = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc());
    midnight
        .and_then(|m| (m - now).to_std().ok())
        .unwrap_or(Duration::from_secs(24 * 60 * 60))
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval(every) => write!(f, "interval({}s)", every.as_secs()),
            Trigger::Daily => f.write_str("daily"),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

/// An event delivered to the engine.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    /// Which pipeline this event is for
    pub pipeline: String,
    /// What kind of trigger caused this event
    pub trigger: Trigger,
}
