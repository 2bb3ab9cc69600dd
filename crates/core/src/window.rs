//! Contact window (business hours) for outreach.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Timelike, Utc, Weekday,
};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Hours during which leads may be contacted, in a fixed UTC offset.
///
/// `start_hour` is inclusive and `end_hour` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    #[serde(default = "default_weekdays_only")]
    pub weekdays_only: bool,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_weekdays_only() -> bool {
    true
}

impl Default for ContactWindow {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 17,
            weekdays_only: true,
            utc_offset_minutes: 0,
        }
    }
}

impl ContactWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> DomainResult<Self> {
        let window = Self {
            start_hour,
            end_hour,
            ..Self::default()
        };
        window.validate()?;
        Ok(window)
    }

    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    pub fn with_weekends(mut self) -> Self {
        self.weekdays_only = false;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.start_hour >= self.end_hour || self.end_hour > 24 {
            return Err(DomainError::validation(format!(
                "contact window {}..{} is empty or out of range",
                self.start_hour, self.end_hour
            )));
        }
        if FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).is_none() {
            return Err(DomainError::validation(format!(
                "utc offset of {} minutes is out of range",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }

    fn day_allowed(&self, weekday: Weekday) -> bool {
        !self.weekdays_only || !matches!(weekday, Weekday::Sat | Weekday::Sun)
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset());
        self.day_allowed(local.weekday())
            && local.hour() >= self.start_hour
            && local.hour() < self.end_hour
    }

    /// Earliest instant at or after `now` inside the window.
    pub fn next_open(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.contains(now) {
            return now;
        }
        let offset = self.offset();
        let local = now.with_timezone(&offset);
        let today = local.date_naive();

        let first = if local.hour() < self.start_hour { 0 } else { 1 };
        (first..=7)
            .filter_map(|days| today.checked_add_signed(Duration::days(days)))
            .find(|date| self.day_allowed(date.weekday()))
            .and_then(|date| self.opening_on(date, &offset))
            .unwrap_or(now)
    }

    fn opening_on(&self, date: NaiveDate, offset: &FixedOffset) -> Option<DateTime<Utc>> {
        let naive = date.and_hms_opt(self.start_hour, 0, 0)?;
        offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}
