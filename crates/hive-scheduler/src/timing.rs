//! Cron expression handling, zone validation, and RunAt normalization.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{Result, SchedulerError};

/// Convert a standard 5-field Unix cron expression to the 7-field format
/// expected by the `cron` crate: seconds are pinned to `0`, the year field
/// to `*`. Expressions with 6+ fields pass through untouched.
fn to_seven_field(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {} *", expression)
    } else {
        expression.to_string()
    }
}

/// Parse a cron expression, accepting the common 5-field form.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    Schedule::from_str(&to_seven_field(expression))
        .map_err(|e| SchedulerError::InvalidCron(e.to_string()))
}

/// Validate an IANA time-zone name ("Europe/Vienna", "UTC").
pub fn parse_zone(time_zone: &str) -> Result<Tz> {
    time_zone
        .parse()
        .map_err(|_| SchedulerError::InvalidTimeZone(time_zone.to_string()))
}

/// Next occurrence of `expression` strictly after `after`, evaluated in
/// `time_zone` when given. `None` means the schedule never fires again.
pub fn next_cron_occurrence(
    expression: &str,
    time_zone: Option<&str>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_cron(expression)?;

    let next = match time_zone {
        Some(name) => {
            let tz = parse_zone(name)?;
            schedule
                .after(&after.with_timezone(&tz))
                .next()
                .map(|local| local.with_timezone(&Utc))
        }
        None => schedule.after(&after).next(),
    };

    Ok(next)
}

/// Delay in ms until `run_at`, clamped to zero. The instant is absolute, so
/// the zone only matters for validation, which the caller does separately.
pub fn run_at_delay_ms(run_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (run_at.timestamp_millis() - now.timestamp_millis()).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_parse() {
        assert!(parse_cron("0 0 * * *").is_ok());
        assert!(parse_cron("*/15 * * * *").is_ok());
        assert!(parse_cron("0 9 * * 1-5").is_ok());
    }

    #[test]
    fn invalid_expressions_rejected() {
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("60 0 * * *").is_err()); // minute out of range
        assert!(parse_cron("* * * *").is_err()); // missing field
    }

    #[test]
    fn zone_validation() {
        assert!(parse_zone("UTC").is_ok());
        assert!(parse_zone("America/New_York").is_ok());
        assert!(parse_zone("Not/A_Zone").is_err());
    }

    #[test]
    fn next_occurrence_daily_midnight() {
        let after = Utc.with_ymd_and_hms(2026, 1, 19, 10, 30, 0).unwrap();
        let next = next_cron_occurrence("0 0 * * *", None, after).unwrap().unwrap();
        assert_eq!(next.to_rfc3339(), "2026-01-20T00:00:00+00:00");
    }

    #[test]
    fn next_occurrence_respects_zone() {
        // 9am Sydney on Jan 20 = 2026-01-19 22:00 UTC (AEDT, UTC+11).
        let after = Utc.with_ymd_and_hms(2026, 1, 19, 20, 0, 0).unwrap();
        let next = next_cron_occurrence("0 9 * * *", Some("Australia/Sydney"), after)
            .unwrap()
            .unwrap();
        assert_eq!(next.to_rfc3339(), "2026-01-19T22:00:00+00:00");
    }

    #[test]
    fn run_at_delay_clamps_past_to_zero() {
        let now = Utc.with_ymd_and_hms(2026, 1, 19, 12, 0, 0).unwrap();
        let future = now + chrono::Duration::milliseconds(750);
        let past = now - chrono::Duration::seconds(5);

        assert_eq!(run_at_delay_ms(future, now), 750);
        assert_eq!(run_at_delay_ms(past, now), 0);
    }
}
