//! Recurring job definitions.
//!
//! A [`Schedule`] fires either on a cron expression or on a fixed interval, and
//! tracks its own pause flag and run count. It is a plain value: every mutator
//! returns a new snapshot, which the engine persists between evaluations.

mod expression;

pub use expression::CronExpression;

use crate::error::ScheduleError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// What makes a schedule fire
#[derive(Debug, Clone, PartialEq)]
enum Trigger {
    Cron(CronExpression),
    /// Seconds between runs, always positive
    Interval(i64),
}

/// A recurring job definition.
///
/// Times are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleRecord", into = "ScheduleRecord")]
pub struct Schedule {
    id: String,
    payload: Value,
    trigger: Trigger,
    start_at: Option<i64>,
    end_at: Option<i64>,
    max_runs: Option<u64>,
    run_count: u64,
    paused: bool,
}

/// Persisted form of a [`Schedule`]; all fields round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    pub id: String,
    pub payload: Value,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval: Option<i64>,
    #[serde(default)]
    pub start_at: Option<i64>,
    #[serde(default)]
    pub end_at: Option<i64>,
    #[serde(default)]
    pub max_runs: Option<u64>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub paused: bool,
}

impl Schedule {
    /// Create a schedule from optional cron and interval triggers.
    ///
    /// Exactly one of them must be given.
    pub fn new(
        id: impl Into<String>,
        payload: Value,
        cron: Option<&str>,
        interval: Option<i64>,
    ) -> Result<Self, ScheduleError> {
        let trigger = match (cron, interval) {
            (None, None) => return Err(ScheduleError::MissingTrigger),
            (Some(_), Some(_)) => return Err(ScheduleError::ConflictingTrigger),
            (Some(expression), None) => Trigger::Cron(CronExpression::parse(expression)?),
            (None, Some(seconds)) if seconds <= 0 => return Err(ScheduleError::InvalidInterval),
            (None, Some(seconds)) => Trigger::Interval(seconds),
        };

        Ok(Self {
            id: id.into(),
            payload,
            trigger,
            start_at: None,
            end_at: None,
            max_runs: None,
            run_count: 0,
            paused: false,
        })
    }

    /// Create a cron-driven schedule
    pub fn cron(id: impl Into<String>, payload: Value, expression: &str) -> Result<Self, ScheduleError> {
        Self::new(id, payload, Some(expression), None)
    }

    /// Create a schedule that fires every `seconds`
    pub fn interval(id: impl Into<String>, payload: Value, seconds: i64) -> Result<Self, ScheduleError> {
        Self::new(id, payload, None, Some(seconds))
    }

    /// Do not fire before `start_at`
    pub fn with_start_at(mut self, start_at: i64) -> Self {
        self.start_at = Some(start_at);
        self
    }

    /// Do not fire after `end_at`
    pub fn with_end_at(mut self, end_at: i64) -> Self {
        self.end_at = Some(end_at);
        self
    }

    /// Retire the schedule after `max_runs` runs
    pub fn with_max_runs(mut self, max_runs: u64) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match &self.trigger {
            Trigger::Cron(expression) => Some(expression.as_str()),
            Trigger::Interval(_) => None,
        }
    }

    /// Interval in seconds, for interval schedules
    pub fn interval_seconds(&self) -> Option<i64> {
        match self.trigger {
            Trigger::Interval(seconds) => Some(seconds),
            Trigger::Cron(_) => None,
        }
    }

    pub fn start_at(&self) -> Option<i64> {
        self.start_at
    }

    pub fn end_at(&self) -> Option<i64> {
        self.end_at
    }

    pub fn max_runs(&self) -> Option<u64> {
        self.max_runs
    }

    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether the schedule can still fire right now
    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now().timestamp())
    }

    /// False iff paused, out of runs, or past `end_at`
    pub fn is_active_at(&self, now: i64) -> bool {
        if self.paused {
            return false;
        }
        if self.max_runs.is_some_and(|max| self.run_count >= max) {
            return false;
        }
        if self.end_at.is_some_and(|end| now > end) {
            return false;
        }
        true
    }

    /// Next fire time after `last_run` (or the first one when `None`)
    pub fn next_run_time(&self, last_run: Option<i64>) -> Option<i64> {
        self.next_run_time_at(last_run, Utc::now().timestamp())
    }

    /// Next fire time evaluated at `now`.
    ///
    /// Returns `None` when the schedule is inactive or the next run would fall
    /// after `end_at`. An overdue interval schedule skips the missed ticks and
    /// returns the first `last_run + k * interval` later than `now`. Times
    /// beyond the `i64` range count as no next run.
    pub fn next_run_time_at(&self, last_run: Option<i64>, now: i64) -> Option<i64> {
        if !self.is_active_at(now) {
            return None;
        }

        let next = match &self.trigger {
            Trigger::Cron(expression) => {
                let mut base = last_run.unwrap_or(now);
                if let Some(start_at) = self.start_at {
                    base = base.max(start_at);
                }
                expression.next_after(base)?
            }
            Trigger::Interval(interval) => match last_run {
                None => self.start_at.unwrap_or(now),
                Some(last_run) => {
                    let next = last_run.checked_add(*interval)?;
                    if next < now {
                        let missed = now.checked_sub(last_run)? / interval;
                        missed.checked_add(1)?.checked_mul(*interval)?.checked_add(last_run)?
                    } else {
                        next
                    }
                }
            },
        };

        match self.end_at {
            Some(end_at) if next > end_at => None,
            _ => Some(next),
        }
    }

    /// Copy with one more completed run
    pub fn increment_run_count(&self) -> Self {
        Self {
            run_count: self.run_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Paused copy
    pub fn pause(&self) -> Self {
        Self {
            paused: true,
            ..self.clone()
        }
    }

    /// Resumed copy
    pub fn resume(&self) -> Self {
        Self {
            paused: false,
            ..self.clone()
        }
    }

    /// Human-readable summary, e.g. "Cron: */5 * * * *" or "Every 2 hours"
    pub fn description(&self) -> String {
        match &self.trigger {
            Trigger::Cron(expression) => format!("Cron: {}", expression.as_str()),
            Trigger::Interval(seconds) => {
                let (count, unit) = [(DAY, "day"), (HOUR, "hour"), (MINUTE, "minute")]
                    .into_iter()
                    .find(|(size, _)| seconds % size == 0)
                    .map(|(size, unit)| (seconds / size, unit))
                    .unwrap_or((*seconds, "second"));
                let plural = if count == 1 { "" } else { "s" };
                format!("Every {} {}{}", count, unit, plural)
            }
        }
    }

    pub fn to_record(&self) -> ScheduleRecord {
        self.clone().into()
    }

    pub fn from_record(record: ScheduleRecord) -> Result<Self, ScheduleError> {
        Self::try_from(record)
    }
}

impl From<Schedule> for ScheduleRecord {
    fn from(schedule: Schedule) -> Self {
        let (cron, interval) = match schedule.trigger {
            Trigger::Cron(expression) => (Some(expression.as_str().to_string()), None),
            Trigger::Interval(seconds) => (None, Some(seconds)),
        };

        Self {
            id: schedule.id,
            payload: schedule.payload,
            cron,
            interval,
            start_at: schedule.start_at,
            end_at: schedule.end_at,
            max_runs: schedule.max_runs,
            run_count: schedule.run_count,
            paused: schedule.paused,
        }
    }
}

impl TryFrom<ScheduleRecord> for Schedule {
    type Error = ScheduleError;

    fn try_from(record: ScheduleRecord) -> Result<Self, Self::Error> {
        let mut schedule = Schedule::new(
            record.id,
            record.payload,
            record.cron.as_deref(),
            record.interval,
        )?;
        schedule.start_at = record.start_at;
        schedule.end_at = record.end_at;
        schedule.max_runs = record.max_runs;
        schedule.run_count = record.run_count;
        schedule.paused = record.paused;
        Ok(schedule)
    }
}
