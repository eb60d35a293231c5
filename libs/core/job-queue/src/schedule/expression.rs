//! Cron expressions on top of the `cron` crate.
//!
//! The `cron` crate expects a leading seconds field and numbers days of the
//! week 1-7 starting on Sunday. Classic five-field expressions use 0-7 with
//! both 0 and 7 meaning Sunday, so they are rewritten before parsing.

use crate::error::ScheduleError;
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// A validated cron expression that remembers its original text
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    /// Parse a five-field (`m h dom mon dow`), six/seven-field (with seconds and
    /// year) or `@daily`-style expression.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let normalized = normalize(expression)?;
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| ScheduleError::InvalidCron(format!("{}: {}", expression, e)))?;

        Ok(Self {
            source: expression.to_string(),
            schedule,
        })
    }

    /// The expression as written by the caller
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `unix_time`
    pub fn next_after(&self, unix_time: i64) -> Option<i64> {
        let base: DateTime<Utc> = DateTime::from_timestamp(unix_time, 0)?;
        self.schedule.after(&base).next().map(|at| at.timestamp())
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

fn normalize(expression: &str) -> Result<String, ScheduleError> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            day_of_week(fields[4])
                .ok_or_else(|| ScheduleError::InvalidCron(expression.to_string()))?
        )),
        6 | 7 => Ok(fields.join(" ")),
        _ => Err(ScheduleError::InvalidCron(expression.to_string())),
    }
}

/// 0-7 (Sunday = 0 or 7) to 1-7 (Sunday = 1)
fn cron_day(day: u8) -> u8 {
    day % 7 + 1
}

fn day_of_week(field: &str) -> Option<String> {
    let parts = field
        .split(',')
        .map(day_of_week_part)
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join(","))
}

fn day_of_week_part(part: &str) -> Option<String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };
    let with_step = |range: String| match step {
        Some(step) => format!("{}/{}", range, step),
        None => range,
    };

    if range == "*" || range == "?" {
        return Some(with_step(range.to_string()));
    }

    if let Some((start, end)) = range.split_once('-') {
        return match (start.parse::<u8>(), end.parse::<u8>()) {
            // Sunday at both ends covers the whole week
            (Ok(0), Ok(7)) => Some(with_step("1-7".to_string())),
            (Ok(start), Ok(end)) if start <= end && end <= 7 => {
                if end == 7 {
                    // Range ends on Sunday: split off the wrap-around.
                    if step.is_some() {
                        return None;
                    }
                    if start == 7 {
                        Some("1".to_string())
                    } else {
                        Some(format!("{}-7,1", cron_day(start)))
                    }
                } else {
                    Some(with_step(format!("{}-{}", cron_day(start), cron_day(end))))
                }
            }
            (Err(_), Err(_)) => Some(with_step(range.to_string())),
            _ => None,
        };
    }

    match range.parse::<u8>() {
        Ok(day) if day <= 7 => Some(with_step(cron_day(day).to_string())),
        Ok(_) => None,
        Err(_) => Some(with_step(range.to_string())),
    }
}
