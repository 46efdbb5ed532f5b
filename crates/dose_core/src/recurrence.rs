use std::collections::BTreeSet;
use std::fmt;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Weekday tag ordered Monday first, matching the week layout of the calendar views.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WeekdayTag {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl WeekdayTag {
    pub const ALL: [WeekdayTag; 7] = [
        WeekdayTag::Mon,
        WeekdayTag::Tue,
        WeekdayTag::Wed,
        WeekdayTag::Thu,
        WeekdayTag::Fri,
        WeekdayTag::Sat,
        WeekdayTag::Sun,
    ];

    pub fn of(date: NaiveDate) -> Self {
        date.weekday().into()
    }

    pub fn short_name(self) -> &'static str {
        match self {
            WeekdayTag::Mon => "Mon",
            WeekdayTag::Tue => "Tue",
            WeekdayTag::Wed => "Wed",
            WeekdayTag::Thu => "Thu",
            WeekdayTag::Fri => "Fri",
            WeekdayTag::Sat => "Sat",
            WeekdayTag::Sun => "Sun",
        }
    }
}

impl From<Weekday> for WeekdayTag {
    fn from(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => WeekdayTag::Mon,
            Weekday::Tue => WeekdayTag::Tue,
            Weekday::Wed => WeekdayTag::Wed,
            Weekday::Thu => WeekdayTag::Thu,
            Weekday::Fri => WeekdayTag::Fri,
            Weekday::Sat => WeekdayTag::Sat,
            Weekday::Sun => WeekdayTag::Sun,
        }
    }
}

impl fmt::Display for WeekdayTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Which calendar dates a regimen is active on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value")]
pub enum RecurrenceRule {
    #[default]
    Daily,
    IntervalDays(u32),
    Weekdays(BTreeSet<WeekdayTag>),
}

impl RecurrenceRule {
    pub fn weekdays(days: impl IntoIterator<Item = WeekdayTag>) -> Self {
        RecurrenceRule::Weekdays(days.into_iter().collect())
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            RecurrenceRule::Daily => Ok(()),
            RecurrenceRule::IntervalDays(0) => Err(ConfigurationError::NonPositiveInterval(0)),
            RecurrenceRule::IntervalDays(_) => Ok(()),
            RecurrenceRule::Weekdays(days) if days.is_empty() => {
                Err(ConfigurationError::EmptyWeekdays)
            }
            RecurrenceRule::Weekdays(_) => Ok(()),
        }
    }

    /// Whether `date` is an active day for a regimen that started on `start`.
    ///
    /// Dates before `start` are never active. Interval rules are anchored on `start`.
    pub fn is_active(&self, start: NaiveDate, date: NaiveDate) -> Result<bool, ConfigurationError> {
        self.validate()?;
        if date < start {
            return Ok(false);
        }
        let active = match self {
            RecurrenceRule::Daily => true,
            RecurrenceRule::IntervalDays(n) => {
                let diff = date.signed_duration_since(start).num_days();
                diff % i64::from(*n) == 0
            }
            RecurrenceRule::Weekdays(days) => days.contains(&WeekdayTag::of(date)),
        };
        Ok(active)
    }

    pub fn label(&self) -> String {
        match self {
            RecurrenceRule::Daily => "Every day".to_string(),
            RecurrenceRule::IntervalDays(1) => "Every day".to_string(),
            RecurrenceRule::IntervalDays(n) => format!("Every {n} days"),
            RecurrenceRule::Weekdays(days) => days
                .iter()
                .map(|day| day.short_name())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}
