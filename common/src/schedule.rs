// Schedule parsing and next fire time calculation
//
// A repository schedule is either a positive number of minutes or a cron
// expression. Five-field (minute precision) cron is accepted alongside the
// six/seven-field form with seconds.

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const SECONDS_PER_MINUTE: u64 = 60;

/// Parsed, validated schedule
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// Fire every `Duration`, first tick one period after installation
    Interval(Duration),
    /// Fire at each cron occurrence, evaluated in `timezone`
    Cron {
        expression: String,
        schedule: CronSchedule,
        timezone: Tz,
    },
}

impl ScheduleSpec {
    /// Parse a repository schedule string.
    ///
    /// Returns `Ok(None)` for an empty schedule (event-driven only).
    pub fn parse(raw: &str, timezone: Tz) -> Result<Option<Self>, ScheduleError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        if looks_numeric(raw) {
            return parse_interval(raw).map(|interval| Some(ScheduleSpec::Interval(interval)));
        }

        let expression = normalize_cron_expression(raw)?;
        let schedule = parse_cron_expression(&expression)?;
        Ok(Some(ScheduleSpec::Cron {
            expression,
            schedule,
            timezone,
        }))
    }

    /// Next fire time strictly after `after`
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            ScheduleSpec::Interval(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|step| after.checked_add_signed(step))
                .ok_or_else(|| ScheduleError::NoNextExecution {
                    schedule_type: "interval".to_string(),
                }),
            ScheduleSpec::Cron {
                schedule, timezone, ..
            } => schedule
                .after(&after.with_timezone(timezone))
                .next()
                .map(|next| next.with_timezone(&Utc))
                .ok_or_else(|| ScheduleError::NoNextExecution {
                    schedule_type: "cron".to_string(),
                }),
        }
    }

    pub fn schedule_type(&self) -> &'static str {
        match self {
            ScheduleSpec::Interval(_) => "interval",
            ScheduleSpec::Cron { .. } => "cron",
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Interval(interval) => {
                write!(f, "every {} minute(s)", interval.as_secs() / SECONDS_PER_MINUTE)
            }
            ScheduleSpec::Cron {
                expression,
                timezone,
                ..
            } => write!(f, "cron '{}' ({})", expression, timezone),
        }
    }
}

/// Integers, signed or not, are always intervals; anything else is cron
fn looks_numeric(raw: &str) -> bool {
    let digits = raw.strip_prefix(&['-', '+'][..]).unwrap_or(raw);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn parse_interval(raw: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(raw.to_string());

    let minutes: i64 = raw.parse().map_err(|_| invalid())?;
    if minutes <= 0 {
        return Err(invalid());
    }

    (minutes as u64)
        .checked_mul(SECONDS_PER_MINUTE)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Prefix five-field expressions with a zero seconds field
pub fn normalize_cron_expression(raw: &str) -> Result<String, ScheduleError> {
    if raw.starts_with('@') {
        return Ok(raw.to_string());
    }

    let fields: Vec<&str> = raw.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(ScheduleError::InvalidCronExpression {
            expression: raw.to_string(),
            reason: format!("expected 5, 6 or 7 fields, found {}", n),
        }),
    }
}

/// Parse a normalized cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse an IANA timezone name such as `UTC` or `Asia/Ho_Chi_Minh`
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name.trim()).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}
