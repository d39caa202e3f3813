use chrono::{DateTime, Datelike};
use serde::{Deserialize, Serialize};

const MINUTES_PER_DAY: i64 = 24 * 60;
const SECS_PER_DAY: i64 = 86_400;

/// Weekly mask plus a daily window, evaluated in a fixed timezone offset.
///
/// `days` starts on Monday. Offsets are minutes after local midnight; an
/// `end_offset` smaller than `start_offset` describes an overnight window
/// that belongs to the day it started on. `timezone_offset` is the number of
/// minutes to subtract from UTC to get local time.
///
/// # Examples
///
/// ```
/// use oxalert_common::schedule::Schedule;
///
/// // Weekdays, 09:00-18:00 UTC
/// let s = Schedule {
///     days: [true, true, true, true, true, false, false],
///     start_offset: 9 * 60,
///     end_offset: 18 * 60,
///     timezone_offset: 0,
/// };
/// // 2024-01-01 was a Monday
/// assert!(s.allows(1_704_103_200)); // 10:00
/// assert!(!s.allows(1_704_074_400)); // 02:00
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub days: [bool; 7],
    pub start_offset: i64,
    pub end_offset: i64,
    #[serde(default)]
    pub timezone_offset: i64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            days: [true; 7],
            start_offset: 0,
            end_offset: MINUTES_PER_DAY - 1,
            timezone_offset: 0,
        }
    }
}

impl Schedule {
    pub fn allows(&self, ts: i64) -> bool {
        let local = ts - ts.rem_euclid(60) - self.timezone_offset * 60;
        let minute = local.rem_euclid(SECS_PER_DAY) / 60;
        let Some(today) = weekday(local) else {
            return false;
        };
        let yesterday = (today + 6) % 7;

        if self.start_offset <= self.end_offset {
            self.days[today] && minute >= self.start_offset && minute <= self.end_offset
        } else {
            (self.days[today] && minute >= self.start_offset)
                || (self.days[yesterday] && minute <= self.end_offset)
        }
    }

    /// First minute boundary at or after `ts` that the schedule allows.
    /// Returns `None` when no day is enabled.
    pub fn next_allowed(&self, ts: i64) -> Option<i64> {
        if !self.days.iter().any(|d| *d) {
            return None;
        }
        if self.allows(ts) {
            return Some(ts);
        }
        let mut candidate = ts - ts.rem_euclid(60) + 60;
        let limit = candidate + 8 * SECS_PER_DAY;
        while candidate < limit {
            if self.allows(candidate) {
                return Some(candidate);
            }
            candidate += 60;
        }
        None
    }
}

/// Day of week, Monday = 0.
fn weekday(ts: i64) -> Option<usize> {
    DateTime::from_timestamp(ts, 0).map(|dt| dt.weekday().num_days_from_monday() as usize)
}
