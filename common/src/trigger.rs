// Cron trigger calendar: expression validation and fire-time calculation
//
// Accepts standard 5-field crontab expressions (`min hour day month weekday`)
// and 6-field expressions with a leading seconds field. All calculations are
// pure functions of their inputs.

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// Normalize an expression to the 6-field form the `cron` crate parses.
///
/// A 5-field crontab expression gains a `0` seconds field; any other field
/// count is rejected.
pub fn normalize(expression: &str) -> Result<String, ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 => Ok(fields.join(" ")),
        n => Err(ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: format!("expected 5 or 6 fields, got {}", n),
        }),
    }
}

/// Parse an expression into a compiled schedule.
pub fn parse(expression: &str) -> Result<Schedule, ScheduleError> {
    let normalized = normalize(expression)?;
    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Check whether an expression is syntactically valid and has at least one
/// upcoming fire time. Expressions that can never fire (e.g. Feb 30) fail
/// validation rather than looping.
pub fn validate(expression: &str) -> bool {
    match parse(expression) {
        Ok(schedule) => schedule.after(&Utc::now()).next().is_some(),
        Err(_) => false,
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Compute the next fire time strictly after `after`, evaluated in `tz`.
pub fn next_fire_time(
    expression: &str,
    tz: Tz,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = parse(expression)?;
    let after_in_tz = after.with_timezone(&tz);
    schedule
        .after(&after_in_tz)
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| ScheduleError::NoUpcomingFire {
            expression: expression.to_string(),
        })
}

/// Compute the next `n` fire times strictly after `after`, for previews.
pub fn next_n(
    expression: &str,
    tz: Tz,
    n: usize,
    after: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
    let schedule = parse(expression)?;
    let after_in_tz = after.with_timezone(&tz);
    let times: Vec<DateTime<Utc>> = schedule
        .after(&after_in_tz)
        .take(n)
        .map(|t| t.with_timezone(&Utc))
        .collect();
    if times.is_empty() && n > 0 {
        return Err(ScheduleError::NoUpcomingFire {
            expression: expression.to_string(),
        });
    }
    Ok(times)
}

/// Human-readable description of an expression, for status displays.
pub fn describe(expression: &str) -> String {
    let normalized = match normalize(expression) {
        Ok(n) => n,
        Err(_) => return format!("invalid cron expression '{}'", expression),
    };
    let fields: Vec<&str> = normalized.split_whitespace().collect();
    let labels = ["second", "minute", "hour", "day", "month", "weekday"];

    let mut parts = Vec::new();
    for (label, value) in labels.iter().zip(&fields) {
        if *value != "*" {
            parts.push(format!("{} {}", label, value));
        }
    }

    if parts.is_empty() {
        "cron: every second".to_string()
    } else {
        format!("cron: {}", parts.join(", "))
    }
}
