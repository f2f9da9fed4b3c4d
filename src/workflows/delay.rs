// Delay calculator.
//
// Pure calendar arithmetic: same inputs always produce the same due
// instant, so the step executor can recompute a delay on retry without
// double-delaying. All math happens in the workflow's local offset and
// converts back to UTC at the end.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Offset, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::definition::BusinessHours;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelaySpec {
    pub amount: i64,
    pub unit: DelayUnit,
    #[serde(default)]
    pub business_hours_only: bool,
    #[serde(default)]
    pub skip_weekends: bool,
    /// Snap the due instant forward to this local time-of-day.
    #[serde(default)]
    pub time_of_day: Option<NaiveTime>,
}

/// Calendar context a delay is computed against, derived from the
/// workflow settings.
#[derive(Debug, Clone)]
pub struct Calendar {
    pub offset: FixedOffset,
    pub hours: BusinessHours,
}

impl Calendar {
    pub fn new(utc_offset_minutes: i32, hours: BusinessHours) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self { offset, hours }
    }

    fn counts(&self, day: Weekday, skip_weekends: bool) -> bool {
        self.hours.is_open_day(day) && !(skip_weekends && is_weekend(day))
    }

    /// A window that can never open (no countable day, or start >= end)
    /// would make the roll-forward loop below spin forever; such a
    /// calendar is ignored and delays degrade to plain arithmetic.
    fn usable(&self, skip_weekends: bool) -> bool {
        use Weekday::*;
        self.hours.start < self.hours.end
            && [Mon, Tue, Wed, Thu, Fri, Sat, Sun]
                .iter()
                .any(|d| self.counts(*d, skip_weekends))
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

/// Set the wall-clock time of a fixed-offset instant.
fn at_time(dt: DateTime<FixedOffset>, t: NaiveTime) -> DateTime<FixedOffset> {
    dt + t.signed_duration_since(dt.time())
}

/// Roll forward to the nearest instant inside an open business window.
fn roll_into_window(
    mut dt: DateTime<FixedOffset>,
    calendar: &Calendar,
    skip_weekends: bool,
) -> DateTime<FixedOffset> {
    loop {
        if calendar.counts(dt.weekday(), skip_weekends) {
            if dt.time() < calendar.hours.start {
                return at_time(dt, calendar.hours.start);
            }
            if dt.time() < calendar.hours.end {
                return dt;
            }
        }
        dt = at_time(dt + Duration::days(1), calendar.hours.start);
    }
}

/// Compute the next eligible execution instant for a delay.
pub fn due_at(base: DateTime<Utc>, spec: &DelaySpec, calendar: &Calendar) -> DateTime<Utc> {
    let local = base.with_timezone(&calendar.offset);

    let clamp_to_window = spec.business_hours_only && calendar.usable(spec.skip_weekends);

    // Delays measured in business minutes/hours accumulate only
    // countable time inside the window; everything else is a naive add.
    let mut due = if clamp_to_window && matches!(spec.unit, DelayUnit::Minutes | DelayUnit::Hours)
    {
        let mut remaining = match spec.unit {
            DelayUnit::Minutes => spec.amount,
            DelayUnit::Hours => spec.amount * 60,
            _ => unreachable!(),
        };
        let mut cursor = roll_into_window(local, calendar, spec.skip_weekends);
        loop {
            let window_end = at_time(cursor, calendar.hours.end);
            let available = (window_end - cursor).num_minutes();
            if remaining <= available {
                break cursor + Duration::minutes(remaining);
            }
            remaining -= available;
            cursor = roll_into_window(
                at_time(cursor + Duration::days(1), calendar.hours.start),
                calendar,
                spec.skip_weekends,
            );
        }
    } else {
        local
            + match spec.unit {
                DelayUnit::Minutes => Duration::minutes(spec.amount),
                DelayUnit::Hours => Duration::hours(spec.amount),
                DelayUnit::Days => Duration::days(spec.amount),
                DelayUnit::Weeks => Duration::weeks(spec.amount),
            }
    };

    if let Some(tod) = spec.time_of_day {
        due = if due.time() <= tod {
            at_time(due, tod)
        } else {
            at_time(due + Duration::days(1), tod)
        };
    }

    if spec.skip_weekends {
        while is_weekend(due.weekday()) {
            due = due + Duration::days(1);
        }
    }

    if clamp_to_window {
        due = roll_into_window(due, calendar, spec.skip_weekends);
    }

    due.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn cal() -> Calendar {
        Calendar::new(0, BusinessHours::default())
    }

    fn days(amount: i64) -> DelaySpec {
        DelaySpec {
            amount,
            unit: DelayUnit::Days,
            business_hours_only: false,
            skip_weekends: false,
            time_of_day: None,
        }
    }

    #[test]
    fn test_plain_day_delay() {
        // 2026-08-03 is a Monday
        let due = due_at(utc(2026, 8, 3, 10, 0), &days(2), &cal());
        assert_eq!(due, utc(2026, 8, 5, 10, 0));
    }

    #[test]
    fn test_friday_plus_one_day_skipping_weekends_lands_on_monday() {
        // 2026-08-07 is a Friday; +1 day = Saturday, rolled to Monday.
        let spec = DelaySpec {
            skip_weekends: true,
            ..days(1)
        };
        let due = due_at(utc(2026, 8, 7, 17, 0), &spec, &cal());
        assert_eq!(due, utc(2026, 8, 10, 17, 0));
    }

    #[test]
    fn test_time_of_day_snaps_forward() {
        // Monday 10:00 + 1 day = Tuesday 10:00; 09:00 has passed, so the
        // snap moves to Wednesday 09:00.
        let spec = DelaySpec {
            time_of_day: NaiveTime::from_hms_opt(9, 0, 0),
            ..days(1)
        };
        let due = due_at(utc(2026, 8, 3, 10, 0), &spec, &cal());
        assert_eq!(due, utc(2026, 8, 5, 9, 0));
    }

    #[test]
    fn test_time_of_day_same_day_when_not_passed() {
        // Monday 10:00 + 1 day = Tuesday 10:00; 15:00 is still ahead.
        let spec = DelaySpec {
            time_of_day: NaiveTime::from_hms_opt(15, 0, 0),
            ..days(1)
        };
        let due = due_at(utc(2026, 8, 3, 10, 0), &spec, &cal());
        assert_eq!(due, utc(2026, 8, 4, 15, 0));
    }

    #[test]
    fn test_business_hours_accumulation_spills_into_next_day() {
        // Tuesday 16:30, 2 business hours in a 09:00-17:00 window:
        // 30 countable minutes today, 90 tomorrow -> Wednesday 10:30.
        let spec = DelaySpec {
            amount: 2,
            unit: DelayUnit::Hours,
            business_hours_only: true,
            skip_weekends: false,
            time_of_day: None,
        };
        let due = due_at(utc(2026, 8, 4, 16, 30), &spec, &cal());
        assert_eq!(due, utc(2026, 8, 5, 10, 30));
    }

    #[test]
    fn test_business_hours_accumulation_skips_closed_days() {
        // Friday 16:00, 2 business hours: 60 minutes Friday, the rest on
        // Monday since Sat/Sun are closed days.
        let spec = DelaySpec {
            amount: 2,
            unit: DelayUnit::Hours,
            business_hours_only: true,
            skip_weekends: false,
            time_of_day: None,
        };
        let due = due_at(utc(2026, 8, 7, 16, 0), &spec, &cal());
        assert_eq!(due, utc(2026, 8, 10, 10, 0));
    }

    #[test]
    fn test_day_delay_clamped_to_business_window() {
        // Monday 20:00 + 1 day = Tuesday 20:00, outside the window, so it
        // rolls to Wednesday 09:00.
        let spec = DelaySpec {
            business_hours_only: true,
            ..days(1)
        };
        let due = due_at(utc(2026, 8, 3, 20, 0), &spec, &cal());
        assert_eq!(due, utc(2026, 8, 5, 9, 0));
    }

    #[test]
    fn test_offset_calendar_shifts_weekend_boundary() {
        // 2026-08-08 00:30 UTC is still Friday 19:30 in UTC-5; one day
        // later is Saturday local, rolled to Monday 19:30 local.
        let spec = DelaySpec {
            skip_weekends: true,
            ..days(1)
        };
        let calendar = Calendar::new(-300, BusinessHours::default());
        let due = due_at(utc(2026, 8, 8, 0, 30), &spec, &calendar);
        assert_eq!(due, utc(2026, 8, 11, 0, 30));
    }

    #[test]
    fn test_deterministic_for_identical_inputs() {
        let base = utc(2026, 8, 7, 17, 0);
        let spec = DelaySpec {
            skip_weekends: true,
            time_of_day: NaiveTime::from_hms_opt(9, 30, 0),
            ..days(3)
        };
        assert_eq!(due_at(base, &spec, &cal()), due_at(base, &spec, &cal()));
    }

    #[test]
    fn test_unusable_window_degrades_to_plain_arithmetic() {
        let calendar = Calendar::new(
            0,
            BusinessHours {
                days: vec![],
                ..BusinessHours::default()
            },
        );
        let spec = DelaySpec {
            amount: 2,
            unit: DelayUnit::Hours,
            business_hours_only: true,
            skip_weekends: false,
            time_of_day: None,
        };
        let due = due_at(utc(2026, 8, 3, 10, 0), &spec, &calendar);
        assert_eq!(due, utc(2026, 8, 3, 12, 0));
    }

    #[test]
    fn test_minute_delay_without_calendar_flags() {
        let due = due_at(
            utc(2026, 8, 3, 10, 0),
            &DelaySpec {
                amount: 45,
                unit: DelayUnit::Minutes,
                business_hours_only: false,
                skip_weekends: false,
                time_of_day: None,
            },
            &cal(),
        );
        assert_eq!(due, utc(2026, 8, 3, 10, 45));
    }
}
