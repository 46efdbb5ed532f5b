//! Month grid and week strip used by the date pickers.
//!
//! Weeks start on Monday. The month grid is always 6 x 7 cells so navigation never changes
//! the layout height.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{ScheduleError, ScheduleResult};
use crate::recurrence::WeekdayTag;

pub const GRID_CELLS: usize = 42;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub is_current_month: bool,
}

/// 42 consecutive days starting on the Monday on or before the 1st of the month.
pub fn build_month_grid(year: i32, month: u32) -> ScheduleResult<Vec<CalendarDay>> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or(ScheduleError::InvalidMonth { year, month })?;
    let leading = i64::from(first.weekday().num_days_from_monday());
    let grid_start = first - Duration::days(leading);
    Ok(grid_start
        .iter_days()
        .take(GRID_CELLS)
        .map(|date| CalendarDay {
            date,
            is_current_month: date.month() == month && date.year() == year,
        })
        .collect())
}

/// The month currently shown by a picker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonthCursor {
    year: i32,
    month: u32,
}

impl MonthCursor {
    pub fn new(year: i32, month: u32) -> ScheduleResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(ScheduleError::InvalidMonth { year, month });
        }
        Ok(Self { year, month })
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn jump_to(self, year: i32, month: u32) -> ScheduleResult<Self> {
        Self::new(year, month)
    }

    pub fn grid(&self) -> ScheduleResult<Vec<CalendarDay>> {
        build_month_grid(self.year, self.month)
    }

    pub fn title(&self) -> String {
        format!("{} {}", month_name(self.month), self.year)
    }
}

pub fn month_name(month: u32) -> &'static str {
    match month {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        12 => "December",
        _ => "Invalid Month",
    }
}

/// One card of the horizontal date selector on the schedule screen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateCard {
    pub date: NaiveDate,
    pub weekday: WeekdayTag,
    pub is_today: bool,
    /// Past days cannot be selected.
    pub is_past: bool,
}

pub fn week_strip(today: NaiveDate, start: NaiveDate, len: usize) -> Vec<DateCard> {
    start
        .iter_days()
        .take(len)
        .map(|date| DateCard {
            date,
            weekday: WeekdayTag::of(date),
            is_today: date == today,
            is_past: date < today,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn every_month_has_42_cells_starting_monday() {
        for year in [1999, 2023, 2024, 2100] {
            for month in 1..=12 {
                let grid = build_month_grid(year, month).unwrap();
                assert_eq!(grid.len(), GRID_CELLS);
                assert_eq!(WeekdayTag::of(grid[0].date), WeekdayTag::Mon);
                for pair in grid.windows(2) {
                    assert_eq!(pair[1].date, pair[0].date + Duration::days(1));
                }
                let in_month = grid.iter().filter(|day| day.is_current_month).count();
                let first = date(year, month, 1);
                let next_first = MonthCursor::containing(first).next();
                let days = date(next_first.year(), next_first.month(), 1)
                    .signed_duration_since(first)
                    .num_days();
                assert_eq!(in_month as i64, days);
            }
        }
    }

    #[test]
    fn month_starting_monday_has_no_leading_days() {
        // 2024-01-01 is a Monday.
        let grid = build_month_grid(2024, 1).unwrap();
        assert_eq!(grid[0].date, date(2024, 1, 1));
        assert!(grid[0].is_current_month);
        assert_eq!(grid[41].date, date(2024, 2, 11));
        assert!(!grid[41].is_current_month);
    }

    #[test]
    fn month_starting_sunday_has_six_leading_days() {
        // 2024-09-01 is a Sunday.
        let grid = build_month_grid(2024, 9).unwrap();
        assert_eq!(grid[0].date, date(2024, 8, 26));
        assert!(grid[..6].iter().all(|day| !day.is_current_month));
        assert_eq!(grid[6].date, date(2024, 9, 1));
        assert!(grid[6].is_current_month);
    }

    #[test]
    fn invalid_month_is_rejected() {
        assert!(matches!(
            build_month_grid(2024, 13),
            Err(ScheduleError::InvalidMonth { month: 13, .. })
        ));
        assert!(MonthCursor::new(2024, 0).is_err());
    }

    #[test]
    fn cursor_navigation_wraps_years() {
        let cursor = MonthCursor::new(2024, 1).unwrap();
        assert_eq!(cursor.previous(), MonthCursor::new(2023, 12).unwrap());
        assert_eq!(cursor.previous().next(), cursor);
        let december = cursor.jump_to(2025, 12).unwrap();
        assert_eq!(december.next(), MonthCursor::new(2026, 1).unwrap());
        assert_eq!(december.title(), "December 2025");
        assert_eq!(december.grid().unwrap().len(), GRID_CELLS);
    }

    #[test]
    fn week_strip_flags_today_and_past() {
        let today = date(2024, 6, 5);
        let cards = week_strip(today, date(2024, 6, 3), 5);
        assert_eq!(cards.len(), 5);
        assert_eq!(cards[0].weekday, WeekdayTag::Mon);
        assert!(cards[0].is_past && cards[1].is_past);
        assert!(cards[2].is_today && !cards[2].is_past);
        assert!(!cards[4].is_today && !cards[4].is_past);
    }
}
