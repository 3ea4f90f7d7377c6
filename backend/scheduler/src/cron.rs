//! Cron expression validation and next-run computation.
//!
//! Expressions use 5-field syntax (minute, hour, day-of-month, month,
//! day-of-week) with `*`, lists, ranges, and steps. Validation happens at
//! schedule time; an expression that fails here never enters the registry.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use ::cron::Schedule;

use pacer_core::SchedulerError;

const VALID_RANGES: &[(u32, u32)] = &[
    (0, 59), // minute
    (0, 23), // hour
    (1, 31), // day of month
    (1, 12), // month
    (0, 7),  // day of week (0 and 7 both = Sunday)
];

/// Validate a 5-field cron expression, returning the normalized form.
pub fn validate(expr: &str) -> Result<String, SchedulerError> {
    let parts: Vec<&str> = expr.trim().split_whitespace().collect();
    if parts.len() != 5 {
        return Err(SchedulerError::InvalidScheduleExpression(format!(
            "expected 5 fields, got {}: '{}'",
            parts.len(),
            expr
        )));
    }
    for (i, part) in parts.iter().enumerate() {
        validate_field(part, VALID_RANGES[i].0, VALID_RANGES[i].1).map_err(|e| {
            SchedulerError::InvalidScheduleExpression(format!(
                "field {} ('{}') invalid: {}",
                i + 1,
                part,
                e
            ))
        })?;
    }
    let normalized = parts.join(" ");
    // The structural check above is necessary but not sufficient; the full
    // parser is the authority on expansion.
    parse_schedule(&normalized)?;
    Ok(normalized)
}

/// Compute the next trigger instant strictly after `after`.
///
/// Pure function; safe to call concurrently.
pub fn next_run_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    let schedule = parse_schedule(expr)?;
    schedule.after(&after).next().ok_or_else(|| {
        SchedulerError::InvalidScheduleExpression(format!("no upcoming instant for '{}'", expr))
    })
}

/// Parse a 5-field expression into a `Schedule`, prepending the seconds
/// field the `cron` crate requires.
fn parse_schedule(expr: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(&format!("0 {}", expr.trim()))
        .map_err(|e| SchedulerError::InvalidScheduleExpression(format!("{}: {}", expr, e)))
}

/// Check whether a cron field is syntactically valid within [min, max].
fn validate_field(field: &str, min: u32, max: u32) -> Result<(), String> {
    if field == "*" || field == "?" {
        return Ok(());
    }
    let (range_part, _step) = if let Some((r, s)) = field.split_once('/') {
        let step: u32 = s.parse().map_err(|_| format!("step '{}' not numeric", s))?;
        if step == 0 {
            return Err("step must be > 0".into());
        }
        (r, Some(step))
    } else {
        (field, None)
    };

    for part in range_part.split(',') {
        if part == "*" {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| format!("'{}' not numeric", lo))?;
            let hi: u32 = hi.parse().map_err(|_| format!("'{}' not numeric", hi))?;
            if lo > hi || lo < min || hi > max {
                return Err(format!("range {}-{} out of [{}, {}]", lo, hi, min, max));
            }
        } else {
            let v: u32 = part.parse().map_err(|_| format!("'{}' not numeric", part))?;
            if v < min || v > max {
                return Err(format!("value {} out of [{}, {}]", v, min, max));
            }
        }
    }
    Ok(())
}
