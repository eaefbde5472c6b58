use chrono::{DateTime, Datelike};
use serde::{Deserialize, Serialize};

const MINUTES_PER_DAY: i64 = 24 * 60;
const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDay {
    pub name: String,
    pub enabled: bool,
}

/// Weekly delivery window.
///
/// `start_offset` and `end_offset` are minutes since local midnight;
/// `tz_offset` is the number of minutes to subtract from UTC to get local
/// time (so UTC+3 is `-180`). A window whose end is before its start wraps
/// past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default = "all_days")]
    pub days: Vec<ScheduleDay>,
    #[serde(default)]
    pub tz_offset: i64,
    #[serde(default)]
    pub start_offset: i64,
    #[serde(default = "default_end_offset")]
    pub end_offset: i64,
}

fn all_days() -> Vec<ScheduleDay> {
    DAY_NAMES
        .iter()
        .map(|name| ScheduleDay {
            name: (*name).to_string(),
            enabled: true,
        })
        .collect()
}

fn default_end_offset() -> i64 {
    MINUTES_PER_DAY - 1
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            days: all_days(),
            tz_offset: 0,
            start_offset: 0,
            end_offset: default_end_offset(),
        }
    }
}

impl Schedule {
    fn day_enabled(&self, weekday_from_monday: usize) -> bool {
        let name = DAY_NAMES[weekday_from_monday];
        match self
            .days
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
        {
            Some(day) => day.enabled,
            None => self
                .days
                .get(weekday_from_monday)
                .map(|d| d.enabled)
                .unwrap_or(false),
        }
    }

    /// Whether a notification at unix time `ts` falls inside the window.
    ///
    /// # Examples
    ///
    /// ```
    /// use moira_common::schedule::Schedule;
    ///
    /// // 09:00-18:00 UTC, every day.
    /// let schedule = Schedule { start_offset: 9 * 60, end_offset: 18 * 60, ..Default::default() };
    /// assert!(schedule.is_allowed(10 * 3600));
    /// assert!(!schedule.is_allowed(20 * 3600));
    /// ```
    pub fn is_allowed(&self, ts: i64) -> bool {
        let local = ts - ts.rem_euclid(60) - self.tz_offset * 60;
        let Some(date) = DateTime::from_timestamp(local, 0) else {
            return false;
        };
        if !self.day_enabled(date.weekday().num_days_from_monday() as usize) {
            return false;
        }

        let minute = local.rem_euclid(86_400) / 60;
        if self.start_offset <= self.end_offset {
            minute >= self.start_offset && minute <= self.end_offset
        } else {
            minute >= self.start_offset || minute <= self.end_offset
        }
    }

    /// First minute boundary at or after `ts` inside the window, searching
    /// one week ahead. `None` when every day is disabled.
    pub fn next_allowed(&self, ts: i64) -> Option<i64> {
        if self.is_allowed(ts) {
            return Some(ts);
        }
        let mut candidate = ts - ts.rem_euclid(60) + 60;
        for _ in 0..=(7 * MINUTES_PER_DAY) {
            if self.is_allowed(candidate) {
                return Some(candidate);
            }
            candidate += 60;
        }
        None
    }
}
