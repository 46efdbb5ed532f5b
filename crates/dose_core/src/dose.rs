use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{ScheduleError, ScheduleResult};
use crate::regimen::MedicationRegimen;
use crate::store::OverlayStore;

/// Identity of one dose occurrence: `regimenId:YYYY-MM-DD:HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceKey {
    pub regimen_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl InstanceKey {
    pub fn new(regimen_id: impl Into<String>, date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            regimen_id: regimen_id.into(),
            date,
            time,
        }
    }

    pub fn scheduled_at(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.regimen_id,
            self.date.format("%Y-%m-%d"),
            self.time.format("%H:%M")
        )
    }
}

impl FromStr for InstanceKey {
    type Err = ScheduleError;

    // Parsed from the right so regimen ids may contain ':'.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidInstanceKey(raw.to_string());
        let mut parts = raw.rsplitn(4, ':');
        let minute = parts.next().ok_or_else(invalid)?;
        let hour = parts.next().ok_or_else(invalid)?;
        let date = parts.next().ok_or_else(invalid)?;
        let regimen_id = parts.next().ok_or_else(invalid)?;
        if regimen_id.is_empty() {
            return Err(invalid());
        }
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;
        let time = NaiveTime::parse_from_str(&format!("{hour}:{minute}"), "%H:%M")
            .map_err(|_| invalid())?;
        Ok(Self::new(regimen_id, date, time))
    }
}

impl TryFrom<String> for InstanceKey {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceKey> for String {
    fn from(key: InstanceKey) -> Self {
        key.to_string()
    }
}

/// Persisted status record layered onto a derived dose occurrence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusOverlay {
    Taken { taken_at: NaiveDateTime },
    Canceled { canceled_at: NaiveDateTime },
}

/// Stored status of an occurrence. Overdue is never stored: see [`crate::window`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DoseStatus {
    #[default]
    Pending,
    Taken { taken_at: NaiveDateTime },
    Canceled { canceled_at: NaiveDateTime },
}

impl DoseStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, DoseStatus::Pending)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DoseStatus::Pending => "pending",
            DoseStatus::Taken { .. } => "taken",
            DoseStatus::Canceled { .. } => "canceled",
        }
    }
}

impl From<StatusOverlay> for DoseStatus {
    fn from(overlay: StatusOverlay) -> Self {
        match overlay {
            StatusOverlay::Taken { taken_at } => DoseStatus::Taken { taken_at },
            StatusOverlay::Canceled { canceled_at } => DoseStatus::Canceled { canceled_at },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DoseInstance {
    pub key: InstanceKey,
    pub medication_name: String,
    pub dosage_description: String,
    pub status: DoseStatus,
}

impl DoseInstance {
    pub fn scheduled_at(&self) -> NaiveDateTime {
        self.key.scheduled_at()
    }

    pub fn taken_at(&self) -> Option<NaiveDateTime> {
        match self.status {
            DoseStatus::Taken { taken_at } => Some(taken_at),
            _ => None,
        }
    }

    pub fn canceled_at(&self) -> Option<NaiveDateTime> {
        match self.status {
            DoseStatus::Canceled { canceled_at } => Some(canceled_at),
            _ => None,
        }
    }
}

/// Materializes the dose occurrences of `regimen` on `date`, ordered by time of day.
///
/// Occurrences with a persisted overlay carry that status; all others are pending.
pub fn instances_for_date(
    regimen: &MedicationRegimen,
    date: NaiveDate,
    store: &dyn OverlayStore,
) -> ScheduleResult<Vec<DoseInstance>> {
    if !regimen.is_active_date(date)? {
        return Ok(Vec::new());
    }
    let mut instances = Vec::with_capacity(regimen.reminder_slots.len());
    for slot in &regimen.reminder_slots {
        let key = InstanceKey::new(regimen.id.clone(), date, slot.time);
        let status = store.get(&key)?.map(DoseStatus::from).unwrap_or_default();
        instances.push(DoseInstance {
            key,
            medication_name: regimen.medication_name.clone(),
            dosage_description: slot.dosage_description.clone(),
            status,
        });
    }
    instances.sort_by_key(|instance| instance.key.time);
    Ok(instances)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeOfDayBucket {
    Morning,
    Noon,
    Evening,
}

impl TimeOfDayBucket {
    pub fn label(self) -> &'static str {
        match self {
            TimeOfDayBucket::Morning => "Morning",
            TimeOfDayBucket::Noon => "Noon",
            TimeOfDayBucket::Evening => "Evening",
        }
    }
}

/// Where the default morning / noon / evening partition splits the day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketBoundaries {
    #[serde(with = "crate::regimen::hhmm")]
    pub noon_starts: NaiveTime,
    #[serde(with = "crate::regimen::hhmm")]
    pub evening_starts: NaiveTime,
}

impl Default for BucketBoundaries {
    fn default() -> Self {
        Self {
            noon_starts: NaiveTime::from_hms_opt(11, 0, 0).unwrap_or(NaiveTime::MIN),
            evening_starts: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl BucketBoundaries {
    pub fn classify(&self, time: NaiveTime) -> TimeOfDayBucket {
        if time < self.noon_starts {
            TimeOfDayBucket::Morning
        } else if time < self.evening_starts {
            TimeOfDayBucket::Noon
        } else {
            TimeOfDayBucket::Evening
        }
    }
}

/// Groups already-ordered entries by a caller-supplied partition of the day.
///
/// Groups appear in order of their first entry and keep the input order inside.
pub fn group_by_bucket<T, B, F, P>(entries: Vec<T>, time_of: F, partition: P) -> Vec<(B, Vec<T>)>
where
    B: PartialEq,
    F: Fn(&T) -> NaiveTime,
    P: Fn(NaiveTime) -> B,
{
    let mut groups: Vec<(B, Vec<T>)> = Vec::new();
    for entry in entries {
        let bucket = partition(time_of(&entry));
        match groups.iter_mut().find(|(existing, _)| *existing == bucket) {
            Some((_, members)) => members.push(entry),
            None => groups.push((bucket, vec![entry])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::RecurrenceRule;
    use crate::regimen::ReminderSlot;
    use crate::store::InMemoryOverlayStore;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn key_round_trips_through_its_string_form() {
        let key = InstanceKey::new("rx:42", date(2024, 1, 3), time(8, 0));
        assert_eq!(key.to_string(), "rx:42:2024-01-03:08:00");
        let parsed: InstanceKey = "rx:42:2024-01-03:08:00".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for raw in ["", "abc", "r1:2024-01-03", ":2024-01-03:08:00", "r1:2024-13-03:08:00", "r1:2024-01-03:25:00"] {
            assert!(
                matches!(raw.parse::<InstanceKey>(), Err(ScheduleError::InvalidInstanceKey(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn interval_regimen_produces_instances_on_active_days_only() {
        let regimen = MedicationRegimen::new(
            "amox",
            "Amoxicillin",
            date(2024, 1, 1),
            RecurrenceRule::IntervalDays(2),
        )
        .with_slot(ReminderSlot::at(8, 0, "1 capsule").unwrap());
        let store = InMemoryOverlayStore::default();

        let counts: Vec<usize> = (1..=5)
            .map(|d| instances_for_date(&regimen, date(2024, 1, d), &store).unwrap().len())
            .collect();
        assert_eq!(counts, vec![1, 0, 1, 0, 1]);
    }

    #[test]
    fn instances_are_ordered_and_pick_up_overlays() {
        let mut regimen =
            MedicationRegimen::new("met", "Metformin", date(2024, 1, 1), RecurrenceRule::Daily);
        regimen.reminder_slots = vec![
            ReminderSlot::at(20, 0, "1 tablet").unwrap(),
            ReminderSlot::at(7, 0, "1 tablet").unwrap(),
        ];
        let store = InMemoryOverlayStore::default();
        let taken_at = date(2024, 1, 2).and_hms_opt(7, 5, 0).unwrap();
        store
            .set(
                &InstanceKey::new("met", date(2024, 1, 2), time(7, 0)),
                StatusOverlay::Taken { taken_at },
            )
            .unwrap();

        let instances = instances_for_date(&regimen, date(2024, 1, 2), &store).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].key.time, time(7, 0));
        assert_eq!(instances[0].taken_at(), Some(taken_at));
        assert_eq!(instances[1].status, DoseStatus::Pending);
        assert_eq!(instances[1].canceled_at(), None);
    }

    #[test]
    fn misconfigured_regimen_is_an_error_not_an_empty_day() {
        let regimen = MedicationRegimen::new(
            "bad",
            "Broken",
            date(2024, 1, 1),
            RecurrenceRule::IntervalDays(0),
        )
        .with_slot(ReminderSlot::at(8, 0, "1").unwrap());
        let store = InMemoryOverlayStore::default();
        assert!(matches!(
            instances_for_date(&regimen, date(2024, 1, 1), &store),
            Err(ScheduleError::Configuration(_))
        ));
    }

    #[test]
    fn default_buckets_split_morning_noon_evening() {
        let bounds = BucketBoundaries::default();
        assert_eq!(bounds.classify(time(8, 0)), TimeOfDayBucket::Morning);
        assert_eq!(bounds.classify(time(11, 0)), TimeOfDayBucket::Noon);
        assert_eq!(bounds.classify(time(12, 0)), TimeOfDayBucket::Noon);
        assert_eq!(bounds.classify(time(18, 0)), TimeOfDayBucket::Evening);
    }

    #[test]
    fn grouping_keeps_order_within_buckets() {
        let times = vec![time(7, 0), time(8, 30), time(12, 0), time(18, 0), time(21, 0)];
        let bounds = BucketBoundaries::default();
        let groups = group_by_bucket(times, |t| *t, |t| bounds.classify(t));
        let summary: Vec<(TimeOfDayBucket, usize)> =
            groups.iter().map(|(bucket, items)| (*bucket, items.len())).collect();
        assert_eq!(
            summary,
            vec![
                (TimeOfDayBucket::Morning, 2),
                (TimeOfDayBucket::Noon, 1),
                (TimeOfDayBucket::Evening, 2)
            ]
        );

        let am_pm = group_by_bucket(vec![time(9, 0), time(13, 0)], |t| *t, |t| t < time(12, 0));
        assert_eq!(am_pm.len(), 2);
        assert!(am_pm[0].0);
    }

    #[test]
    fn status_serializes_with_tag() {
        let status = DoseStatus::Canceled {
            canceled_at: date(2024, 1, 1).and_hms_opt(9, 0, 0).unwrap(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"status":"canceled","canceled_at":"2024-01-01T09:00:00"}"#);
        let pending: DoseStatus = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert!(pending.is_pending());
    }
}
