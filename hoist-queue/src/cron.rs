//! Timezone-aware cron evaluation.
//!
//! Expressions are standard five-field cron with an optional seconds
//! field. Field matching happens in the rule's timezone; the resulting
//! wall-clock instant is then resolved against the timezone database:
//!
//! - a wall time that does not exist (spring-forward gap) shifts forward
//!   to the next valid instant that day;
//! - a wall time that occurs twice (fall-back fold) fires once, at the
//!   earlier occurrence.
//!
//! The `cron` crate alone would skip a nonexistent local time to the
//! next day, so resolution is layered on top of it here.

use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{QueueError, QueueResult};

/// Upper bound on candidate wall times examined per `next_after` call;
/// beyond it the schedule is treated as having no future fire.
const MAX_CANDIDATES: usize = 50_000;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: cron::Schedule,
    tz: Tz,
}

impl CronSchedule {
    pub fn parse(expr: &str, timezone: &str) -> QueueResult<Self> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| QueueError::Validation(format!("unknown timezone: {timezone:?}")))?;

        let fields = expr.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {expr}"),
            6 | 7 => expr.to_string(),
            _ => {
                return Err(QueueError::Validation(format!(
                    "cron expression must have 5 to 7 fields, got {fields}"
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| QueueError::Validation(format!("malformed cron expression: {e}")))?;
        Ok(Self { schedule, tz })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Next fire instant strictly after `after`, or `None` when the
    /// schedule has no future fire.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Iterate candidates in wall-clock space: the naive local time is
        // re-tagged as UTC purely so the field matcher runs on local
        // fields, then each candidate is resolved back through the tz.
        let local_naive = after.with_timezone(&self.tz).naive_local();
        let fake_utc = Utc.from_utc_datetime(&local_naive);
        for candidate in self.schedule.after(&fake_utc).take(MAX_CANDIDATES) {
            let wall = candidate.naive_utc();
            if let Some(resolved) = self.resolve_wall_time(wall) {
                // A gap shift can land at or before `after`; keep looking.
                if resolved > after {
                    return Some(resolved);
                }
            }
        }
        None
    }

    fn resolve_wall_time(&self, wall: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.tz.from_local_datetime(&wall) {
            LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earlier, later) => {
                Some(earlier.min(later).with_timezone(&Utc))
            }
            LocalResult::None => {
                // Spring-forward gap: probe forward minute by minute to
                // the first valid instant. DST gaps are at most a few
                // hours anywhere in the tz database.
                let mut probe = wall;
                for _ in 0..240 {
                    probe += Duration::minutes(1);
                    match self.tz.from_local_datetime(&probe) {
                        LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                        LocalResult::Ambiguous(earlier, later) => {
                            return Some(earlier.min(later).with_timezone(&Utc))
                        }
                        LocalResult::None => continue,
                    }
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn five_field_expressions_are_accepted() {
        let schedule = CronSchedule::parse("*/5 * * * *", "UTC").unwrap();
        let next = schedule.next_after(utc("2026-01-01T00:01:00Z")).unwrap();
        assert_eq!(next, utc("2026-01-01T00:05:00Z"));
    }

    #[test]
    fn six_field_expressions_carry_seconds() {
        let schedule = CronSchedule::parse("30 * * * * *", "UTC").unwrap();
        let next = schedule.next_after(utc("2026-01-01T00:00:00Z")).unwrap();
        assert_eq!(next, utc("2026-01-01T00:00:30Z"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(CronSchedule::parse("not cron", "UTC").is_err());
        assert!(CronSchedule::parse("* * * * *", "Mars/Olympus").is_err());
        assert!(CronSchedule::parse("* * *", "UTC").is_err());
    }

    #[test]
    fn matches_in_rule_timezone() {
        // 02:00 in New York is 07:00 UTC during EST.
        let schedule = CronSchedule::parse("0 0 2 * * *", "America/New_York").unwrap();
        let next = schedule.next_after(utc("2026-01-10T00:00:00Z")).unwrap();
        assert_eq!(next, utc("2026-01-10T07:00:00Z"));
    }

    #[test]
    fn spring_forward_gap_shifts_to_next_valid_instant() {
        // US DST starts 2026-03-08: 02:00 EST jumps to 03:00 EDT, so a
        // daily 2am rule fires at 03:00 EDT (07:00 UTC) that day.
        let schedule = CronSchedule::parse("0 0 2 * * *", "America/New_York").unwrap();
        let next = schedule.next_after(utc("2026-03-08T01:00:00Z")).unwrap();
        assert_eq!(next, utc("2026-03-08T07:00:00Z"));

        // The next day is back to normal: 02:00 EDT = 06:00 UTC.
        let following = schedule.next_after(next).unwrap();
        assert_eq!(following, utc("2026-03-09T06:00:00Z"));
    }

    #[test]
    fn fall_back_fold_fires_once_at_earlier_occurrence() {
        // US DST ends 2026-11-01: 01:30 occurs at 05:30 UTC (EDT) and
        // again at 06:30 UTC (EST). The rule fires at the earlier one.
        let schedule = CronSchedule::parse("0 30 1 * * *", "America/New_York").unwrap();
        let next = schedule.next_after(utc("2026-11-01T00:00:00Z")).unwrap();
        assert_eq!(next, utc("2026-11-01T05:30:00Z"));

        // And only once: the next fire is the following day.
        let following = schedule.next_after(next).unwrap();
        assert_eq!(following, utc("2026-11-02T06:30:00Z"));
    }

    #[test]
    fn bounded_year_schedules_expire() {
        let schedule = CronSchedule::parse("0 0 0 1 1 * 2020", "UTC").unwrap();
        assert_eq!(schedule.next_after(utc("2026-01-01T00:00:00Z")), None);
    }
}
