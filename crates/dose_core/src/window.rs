//! Time-relative views over a dose occurrence.
//!
//! Every function here takes `now` from the caller and never reads the clock, so a scan
//! can be re-run on any tick and produce the same answer for the same instant.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::dose::DoseInstance;

/// Pending and more than `grace_minutes` past the scheduled instant.
///
/// A grace of zero means overdue from the scheduled instant itself.
pub fn is_overdue(instance: &DoseInstance, now: NaiveDateTime, grace_minutes: u32) -> bool {
    if !instance.status.is_pending() {
        return false;
    }
    let scheduled = instance.scheduled_at();
    if now < scheduled {
        return false;
    }
    let elapsed = now - scheduled;
    if grace_minutes == 0 {
        return true;
    }
    elapsed > Duration::minutes(i64::from(grace_minutes))
}

/// Signed time until the scheduled instant; negative once it has passed.
pub fn time_until_due(instance: &DoseInstance, now: NaiveDateTime) -> Duration {
    instance.scheduled_at() - now
}

/// Pending and `now` lies in `[scheduled - lead, scheduled]`.
pub fn is_in_reminder_window(
    instance: &DoseInstance,
    now: NaiveDateTime,
    lead_minutes: u32,
) -> bool {
    if !instance.status.is_pending() {
        return false;
    }
    let scheduled = instance.scheduled_at();
    let opens = scheduled - Duration::minutes(i64::from(lead_minutes));
    opens <= now && now <= scheduled
}

/// Transient flags derived for one occurrence at one instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DoseFlags {
    pub overdue: bool,
    pub in_reminder_window: bool,
    /// Whole minutes until due, negative once passed.
    pub minutes_until_due: i64,
}

impl DoseFlags {
    pub fn evaluate(
        instance: &DoseInstance,
        now: NaiveDateTime,
        grace_minutes: u32,
        lead_minutes: u32,
    ) -> Self {
        Self {
            overdue: is_overdue(instance, now, grace_minutes),
            in_reminder_window: is_in_reminder_window(instance, now, lead_minutes),
            minutes_until_due: time_until_due(instance, now).num_minutes(),
        }
    }
}

/// Short human rendering of a signed countdown, e.g. "in 1 h 05 min" or "due 20 min ago".
pub fn describe_countdown(until_due: Duration) -> String {
    let minutes = until_due.num_minutes();
    if minutes == 0 {
        return "due now".to_string();
    }
    let magnitude = minutes.unsigned_abs();
    let text = if magnitude >= 60 {
        format!("{} h {:02} min", magnitude / 60, magnitude % 60)
    } else {
        format!("{magnitude} min")
    };
    if minutes > 0 {
        format!("in {text}")
    } else {
        format!("due {text} ago")
    }
}
