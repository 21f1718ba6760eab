//! Pure recurrence-rule evaluation for `ScheduledTask` firing (§4.3). Kept
//! free of I/O and the scheduler's own state, in the same spirit as
//! `session::recovery` — a fixture-testable decision function the tick loop
//! calls once per schedule per tick.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Daily,
    Weekly,
    Monthly,
    Interval,
    Once,
}

/// The recurrence-specific fields a `ScheduledTask` carries, isolated from
/// bookkeeping fields (`run_count`, `enabled`, ...) so this module can
/// reason about firing independent of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recurrence {
    pub schedule_type: ScheduleType,
    pub hour: u32,
    pub minute: u32,
    pub weekdays: Vec<u8>,
    pub month_day: Option<u32>,
    pub interval_seconds: Option<i64>,
    pub run_date: Option<NaiveDate>,
    pub first_fire_at: Option<DateTime<Utc>>,
}

/// Evaluate whether `recurrence` should fire at `now`, given the last time
/// it fired (if ever), in the schedule owner's timezone. Called once per
/// scheduler tick; ticks happen every `scheduler_tick_seconds`, so the
/// dedupe logic below (comparing against `last_run`) exists to keep a
/// schedule from firing twice across two ticks that land in the same
/// matching minute.
pub fn should_fire(recurrence: &Recurrence, tz: Tz, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
    let local = now.with_timezone(&tz);

    match recurrence.schedule_type {
        ScheduleType::Daily => {
            time_matches(&local, recurrence) && not_yet_fired_today(local, tz, last_run)
        }
        ScheduleType::Weekly => {
            time_matches(&local, recurrence)
                && recurrence
                    .weekdays
                    .contains(&(local.weekday().num_days_from_sunday() as u8))
                && not_yet_fired_today(local, tz, last_run)
        }
        ScheduleType::Monthly => {
            let Some(month_day) = recurrence.month_day else {
                return false;
            };
            time_matches(&local, recurrence)
                && local.day() == month_day
                && not_yet_fired_today(local, tz, last_run)
        }
        ScheduleType::Interval => {
            let Some(interval_seconds) = recurrence.interval_seconds else {
                return false;
            };
            match last_run {
                None => recurrence.first_fire_at.is_none_or(|first| first <= now),
                Some(last) => (now - last).num_seconds() >= interval_seconds,
            }
        }
        ScheduleType::Once => {
            let Some(run_date) = recurrence.run_date else {
                return false;
            };
            last_run.is_none() && time_matches(&local, recurrence) && local.date_naive() == run_date
        }
    }
}

fn time_matches(local: &DateTime<Tz>, recurrence: &Recurrence) -> bool {
    local.hour() == recurrence.hour && local.minute() == recurrence.minute
}

fn not_yet_fired_today(local: DateTime<Tz>, tz: Tz, last_run: Option<DateTime<Utc>>) -> bool {
    match last_run {
        None => true,
        Some(last) => last.with_timezone(&tz).date_naive() != local.date_naive(),
    }
}

/// Best-effort estimate of the next fire time, used only for the
/// `schedule_executed` event's informational `next_run` field — the tick
/// loop itself re-evaluates `should_fire` fresh every tick rather than
/// trusting this value.
pub fn next_run_after(recurrence: &Recurrence, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match recurrence.schedule_type {
        ScheduleType::Once => None,
        ScheduleType::Interval => {
            let interval = recurrence.interval_seconds?;
            Some(after + ChronoDuration::seconds(interval))
        }
        ScheduleType::Daily => next_daily_match(recurrence, tz, after),
        ScheduleType::Weekly => {
            let mut candidate = after;
            for _ in 0..8 {
                candidate = next_daily_match(recurrence, tz, candidate)?;
                let local = candidate.with_timezone(&tz);
                if recurrence
                    .weekdays
                    .contains(&(local.weekday().num_days_from_sunday() as u8))
                {
                    return Some(candidate);
                }
                candidate += ChronoDuration::seconds(1);
            }
            None
        }
        ScheduleType::Monthly => {
            let month_day = recurrence.month_day?;
            let mut candidate = after;
            for _ in 0..24 {
                candidate = next_daily_match(recurrence, tz, candidate)?;
                if candidate.with_timezone(&tz).day() == month_day {
                    return Some(candidate);
                }
                candidate += ChronoDuration::seconds(1);
            }
            None
        }
    }
}

/// The next UTC instant (strictly after `after`) at which the local
/// wall-clock hour:minute in `recurrence` occurs, ignoring weekday/month-day
/// filters.
fn next_daily_match(recurrence: &Recurrence, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local_after = after.with_timezone(&tz);
    let mut date = local_after.date_naive();
    for _ in 0..366 {
        let candidate_naive = date.and_hms_opt(recurrence.hour, recurrence.minute, 0)?;
        if let chrono::LocalResult::Single(candidate_local) = tz.from_local_datetime(&candidate_naive) {
            let candidate_utc = candidate_local.with_timezone(&Utc);
            if candidate_utc > after {
                return Some(candidate_utc);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;

    fn daily(hour: u32, minute: u32) -> Recurrence {
        Recurrence {
            schedule_type: ScheduleType::Daily,
            hour,
            minute,
            weekdays: vec![],
            month_day: None,
            interval_seconds: None,
            run_date: None,
            first_fire_at: None,
        }
    }

    #[test]
    fn daily_fires_at_local_hour_minute_across_timezone() {
        // user tz UTC+8, daily 09:00 local => 01:00 UTC.
        let tz: Tz = "Etc/GMT-8".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();
        let rule = daily(9, 0);
        assert!(should_fire(&rule, tz, now, None));
    }

    #[test]
    fn daily_does_not_refire_same_day() {
        let tz: Tz = "Etc/GMT-8".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();
        let rule = daily(9, 0);
        assert!(!should_fire(&rule, tz, now, Some(now)));
    }

    #[test]
    fn monthly_day_31_skips_february() {
        let tz: Tz = "UTC".parse().unwrap();
        let rule = Recurrence {
            schedule_type: ScheduleType::Monthly,
            hour: 9,
            minute: 0,
            weekdays: vec![],
            month_day: Some(31),
            interval_seconds: None,
            run_date: None,
            first_fire_at: None,
        };
        // Every tick across February at 09:00 should never fire (Feb has no 31st).
        for day in 1..=28 {
            let now = Utc.with_ymd_and_hms(2026, 2, day, 9, 0, 0).unwrap();
            assert!(!should_fire(&rule, tz, now, None), "fired on 2026-02-{day}");
        }
        let march_31 = Utc.with_ymd_and_hms(2026, 3, 31, 9, 0, 0).unwrap();
        assert!(should_fire(&rule, tz, march_31, None));
    }

    #[test]
    fn interval_with_past_first_fire_fires_once_immediately() {
        let tz: Tz = "UTC".parse().unwrap();
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let rule = Recurrence {
            schedule_type: ScheduleType::Interval,
            hour: 0,
            minute: 0,
            weekdays: vec![],
            month_day: None,
            interval_seconds: Some(3600),
            run_date: None,
            first_fire_at: Some(t - ChronoDuration::seconds(600)),
        };
        assert!(should_fire(&rule, tz, t, None));

        let after_first = t;
        assert!(!should_fire(&rule, tz, t + ChronoDuration::seconds(1800), Some(after_first)));
        assert!(should_fire(&rule, tz, t + ChronoDuration::seconds(3600), Some(after_first)));
    }

    #[test]
    fn interval_with_unset_first_fire_fires_immediately() {
        let tz: Tz = "UTC".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let rule = Recurrence {
            schedule_type: ScheduleType::Interval,
            hour: 0,
            minute: 0,
            weekdays: vec![],
            month_day: None,
            interval_seconds: Some(60),
            run_date: None,
            first_fire_at: None,
        };
        assert!(should_fire(&rule, tz, now, None));
    }

    #[test]
    fn once_fires_a_single_time() {
        let tz: Tz = "UTC".parse().unwrap();
        let run_date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let rule = Recurrence {
            schedule_type: ScheduleType::Once,
            hour: 10,
            minute: 30,
            weekdays: vec![],
            month_day: None,
            interval_seconds: None,
            run_date: Some(run_date),
            first_fire_at: None,
        };
        let fire_time = Utc.with_ymd_and_hms(2026, 6, 1, 10, 30, 0).unwrap();
        assert!(should_fire(&rule, tz, fire_time, None));
        assert!(!should_fire(&rule, tz, fire_time, Some(fire_time)));
    }

    #[test]
    fn weekly_requires_matching_weekday() {
        let tz: Tz = "UTC".parse().unwrap();
        // 2026-01-05 is a Monday.
        let monday = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        let tuesday = Utc.with_ymd_and_hms(2026, 1, 6, 9, 0, 0).unwrap();
        let rule = Recurrence {
            schedule_type: ScheduleType::Weekly,
            hour: 9,
            minute: 0,
            weekdays: vec![1], // Monday, per num_days_from_sunday
            month_day: None,
            interval_seconds: None,
            run_date: None,
            first_fire_at: None,
        };
        assert!(should_fire(&rule, tz, monday, None));
        assert!(!should_fire(&rule, tz, tuesday, None));
    }

    #[test]
    fn next_run_after_daily_lands_on_next_occurrence() {
        let tz: Tz = "UTC".parse().unwrap();
        let rule = daily(9, 0);
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let next = next_run_after(&rule, tz, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_daily_next_run_always_strictly_after_and_on_the_minute(
            hour in 0u32..24,
            minute in 0u32..60,
            offset_days in 0i64..400,
        ) {
            let tz: Tz = "UTC".parse().unwrap();
            let rule = daily(hour, minute);
            let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
                + ChronoDuration::days(offset_days);
            let next = next_run_after(&rule, tz, after);
            prop_assert!(next.is_some());
            let next = next.unwrap();
            prop_assert!(next > after);
            let local = next.with_timezone(&tz);
            prop_assert_eq!(local.hour(), hour);
            prop_assert_eq!(local.minute(), minute);
        }

        #[test]
        fn prop_interval_should_fire_iff_elapsed_reaches_interval(
            interval_seconds in 1i64..100_000,
            elapsed_seconds in 0i64..200_000,
        ) {
            let tz: Tz = "UTC".parse().unwrap();
            let last = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
            let now = last + ChronoDuration::seconds(elapsed_seconds);
            let rule = Recurrence {
                schedule_type: ScheduleType::Interval,
                hour: 0,
                minute: 0,
                weekdays: vec![],
                month_day: None,
                interval_seconds: Some(interval_seconds),
                run_date: None,
                first_fire_at: None,
            };
            let fired = should_fire(&rule, tz, now, Some(last));
            prop_assert_eq!(fired, elapsed_seconds >= interval_seconds);
        }
    }
}
