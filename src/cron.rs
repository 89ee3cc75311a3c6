//! Clock & cron parser — 6-field cron expressions evaluated in a single
//! configured time zone.
//!
//! Field 1 is seconds; the remaining five are the standard
//! minute/hour/day-of-month/month/day-of-week fields. All parsing and
//! "next fire" computation goes through a [`Clock`] so the time zone is an
//! explicit dependency rather than a hidden global.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid-schedule: {0}")]
    InvalidSchedule(String),
}

/// Carries the process-wide scheduling time zone as an explicit value,
/// rather than a hidden global, so all cron math flows through one place.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    tz: Tz,
}

impl Default for Clock {
    fn default() -> Self {
        // Matches the source system's hard-coded +08:00; Asia/Shanghai
        // carries no DST transitions so it is a stable stand-in for a
        // fixed +08:00 offset.
        Self { tz: Tz::Asia__Shanghai }
    }
}

impl Clock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Parse a 6-field cron expression, failing with [`CronError::InvalidSchedule`]
    /// for anything the `cron` crate can't parse.
    pub fn parse(&self, expr: &str) -> Result<ParsedSchedule, CronError> {
        let schedule = Schedule::from_str(expr)
            .map_err(|e| CronError::InvalidSchedule(format!("{expr}: {e}")))?;
        Ok(ParsedSchedule {
            schedule,
            tz: self.tz,
        })
    }

    /// Compute the next fire time strictly after `after`. Returns `None`
    /// only if the schedule can never fire again (never happens for a
    /// well-formed cron expression, but kept as an `Option` so callers
    /// don't need to `unwrap`).
    pub fn next_fire(&self, expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CronError> {
        let parsed = self.parse(expr)?;
        Ok(parsed.next_after(after))
    }
}

pub struct ParsedSchedule {
    schedule: Schedule,
    tz: Tz,
}

impl ParsedSchedule {
    /// `next_fire(expr, t) > t` always holds for the returned value.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after_tz = after.with_timezone(&self.tz);
        self.schedule
            .after(&after_tz)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_fire_is_strictly_monotonic() {
        let clock = Clock::default();
        let t = Tz::Asia__Shanghai
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 3)
            .unwrap()
            .with_timezone(&Utc);
        let next = clock.next_fire("*/10 * * * * *", t).unwrap().unwrap();
        assert!(next > t);
    }

    #[test]
    fn scenario_s1_ten_second_tick() {
        let clock = Clock::default();
        let t = Tz::Asia__Shanghai
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 3)
            .unwrap()
            .with_timezone(&Utc);
        let next = clock.next_fire("*/10 * * * * *", t).unwrap().unwrap();
        let expected = Tz::Asia__Shanghai
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 10)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(next, expected);
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let clock = Clock::default();
        assert!(clock.parse("not a cron expression").is_err());
    }

    #[test]
    fn yearly_schedule_parses() {
        let clock = Clock::default();
        assert!(clock.parse("0 0 0 1 1 *").is_ok());
    }
}
