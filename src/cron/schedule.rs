//! Schedule parsing: seconds-resolution cron expressions and the
//! `@every <duration>` descriptor.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{CronError, Result};

/// A parsed job schedule that can compute the next fire time.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Cron expression with a seconds field (e.g. `*/5 * * * * *`), also
    /// covering descriptors like `@hourly`.
    Cron(Box<cron::Schedule>),
    /// Fixed interval, from `@every 90s` / `@every 1h30m` style specs.
    Every(Duration),
}

impl Schedule {
    pub fn parse(spec: &str) -> Result<Self> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Err(CronError::InvalidSpec("empty spec".to_string()));
        }

        if let Some(interval) = trimmed.strip_prefix("@every ") {
            let duration = parse_interval(interval.trim())?;
            if duration.is_zero() {
                return Err(CronError::InvalidSpec(format!(
                    "zero interval in {trimmed:?}"
                )));
            }
            return Ok(Schedule::Every(duration));
        }

        let schedule = cron::Schedule::from_str(trimmed)
            .map_err(|e| CronError::InvalidSpec(format!("{trimmed:?}: {e}")))?;
        Ok(Schedule::Cron(Box::new(schedule)))
    }

    /// Next fire time strictly after `after`, truncated to whole seconds.
    /// Returns `None` when the schedule has no upcoming occurrence.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => {
                let next = schedule.after(&after).next()?;
                DateTime::from_timestamp(next.timestamp(), 0)
            }
            Schedule::Every(interval) => {
                let interval = chrono::Duration::from_std(*interval).ok()?;
                DateTime::from_timestamp((after + interval).timestamp(), 0)
            }
        }
    }
}

/// Parse a Go-style duration string: one or more `<number><unit>` components
/// with units `ms`, `s`, `m`, `h` (e.g. `90s`, `5m`, `1h30m`).
fn parse_interval(s: &str) -> Result<Duration> {
    if s.is_empty() {
        return Err(CronError::InvalidSpec("empty interval".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;

    while !rest.is_empty() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return Err(CronError::InvalidSpec(format!("invalid interval {s:?}")));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| CronError::InvalidSpec(format!("invalid interval {s:?}")))?;
        rest = &rest[digits..];

        let (unit, len) = if rest.starts_with("ms") {
            (Duration::from_millis(1), 2)
        } else if rest.starts_with('s') {
            (Duration::from_secs(1), 1)
        } else if rest.starts_with('m') {
            (Duration::from_secs(60), 1)
        } else if rest.starts_with('h') {
            (Duration::from_secs(3600), 1)
        } else {
            return Err(CronError::InvalidSpec(format!(
                "unknown unit in interval {s:?}"
            )));
        };
        rest = &rest[len..];

        total += unit * value as u32;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_descriptor() {
        let schedule = Schedule::parse("@every 5s").unwrap();
        assert!(matches!(schedule, Schedule::Every(d) if d == Duration::from_secs(5)));

        let schedule = Schedule::parse("@every 1h30m").unwrap();
        assert!(matches!(schedule, Schedule::Every(d) if d == Duration::from_secs(5400)));
    }

    #[test]
    fn parses_cron_with_seconds() {
        let schedule = Schedule::parse("*/5 * * * * *").unwrap();
        assert!(matches!(schedule, Schedule::Cron(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Schedule::parse("").is_err());
        assert!(Schedule::parse("not a schedule").is_err());
        assert!(Schedule::parse("@every ").is_err());
        assert!(Schedule::parse("@every 5x").is_err());
        assert!(Schedule::parse("@every 0s").is_err());
    }

    #[test]
    fn interval_next_advances_by_duration() {
        let schedule = Schedule::parse("@every 5s").unwrap();
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            schedule.next(now).unwrap(),
            DateTime::from_timestamp(1_700_000_005, 0).unwrap()
        );
    }

    #[test]
    fn cron_next_is_strictly_after() {
        let schedule = Schedule::parse("*/5 * * * * *").unwrap();
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let next = schedule.next(at).unwrap();
        assert!(next > at);
        assert_eq!(next.timestamp() % 5, 0);
    }
}
