use std::collections::HashSet;

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::recurrence::RecurrenceRule;

/// One time of day at which a dose is due, with the amount to take.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSlot {
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub dosage_description: String,
}

impl ReminderSlot {
    /// Seconds are dropped: slots have minute precision.
    pub fn new(time: NaiveTime, dosage_description: impl Into<String>) -> Self {
        Self {
            time: truncate_to_minute(time),
            dosage_description: dosage_description.into(),
        }
    }

    pub fn at(hour: u32, minute: u32, dosage_description: impl Into<String>) -> Option<Self> {
        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        Some(Self::new(time, dosage_description))
    }
}

/// Reminder configuration for one prescribed medication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MedicationRegimen {
    pub id: String,
    pub medication_name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub remaining_quantity: u32,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub recurrence_rule: RecurrenceRule,
    pub reminder_slots: Vec<ReminderSlot>,
    #[serde(default = "default_notifications")]
    pub notifications_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_stock_threshold: Option<u32>,
}

fn default_notifications() -> bool {
    true
}

impl MedicationRegimen {
    pub fn new(
        id: impl Into<String>,
        medication_name: impl Into<String>,
        start_date: NaiveDate,
        recurrence_rule: RecurrenceRule,
    ) -> Self {
        Self {
            id: id.into(),
            medication_name: medication_name.into(),
            unit: String::new(),
            remaining_quantity: 0,
            start_date,
            recurrence_rule,
            reminder_slots: Vec::new(),
            notifications_enabled: true,
            low_stock_threshold: None,
        }
    }

    pub fn with_slot(mut self, slot: ReminderSlot) -> Self {
        self.reminder_slots.push(slot);
        self.sort_slots();
        self
    }

    pub fn with_quantity(mut self, remaining_quantity: u32, unit: impl Into<String>) -> Self {
        self.remaining_quantity = remaining_quantity;
        self.unit = unit.into();
        self
    }

    /// Checks every invariant a regimen must satisfy before it can be saved.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.id.trim().is_empty() {
            return Err(ConfigurationError::EmptyRegimenId);
        }
        if self.medication_name.trim().is_empty() {
            return Err(ConfigurationError::EmptyMedicationName);
        }
        self.recurrence_rule.validate()?;
        if self.reminder_slots.is_empty() {
            return Err(ConfigurationError::EmptyReminderSlots);
        }
        let mut seen = HashSet::new();
        for slot in &self.reminder_slots {
            if !seen.insert(slot.time) {
                return Err(ConfigurationError::DuplicateSlotTime(slot.time));
            }
        }
        Ok(())
    }

    pub fn is_active_date(&self, date: NaiveDate) -> Result<bool, ConfigurationError> {
        self.recurrence_rule.is_active(self.start_date, date)
    }

    pub fn slot_at(&self, time: NaiveTime) -> Option<&ReminderSlot> {
        self.reminder_slots.iter().find(|slot| slot.time == time)
    }

    /// Adds a slot or replaces the dosage of the slot already at that time.
    pub fn upsert_slot(&mut self, slot: ReminderSlot) {
        match self.reminder_slots.iter_mut().find(|s| s.time == slot.time) {
            Some(existing) => existing.dosage_description = slot.dosage_description,
            None => self.reminder_slots.push(slot),
        }
        self.sort_slots();
    }

    /// Moves a slot to a new time. Returns false when no slot exists at `from`.
    pub fn retime_slot(&mut self, from: NaiveTime, to: NaiveTime) -> bool {
        let to = truncate_to_minute(to);
        let Some(slot) = self.reminder_slots.iter_mut().find(|s| s.time == from) else {
            return false;
        };
        slot.time = to;
        self.sort_slots();
        true
    }

    pub fn remove_slot(&mut self, time: NaiveTime) -> bool {
        let before = self.reminder_slots.len();
        self.reminder_slots.retain(|slot| slot.time != time);
        before != self.reminder_slots.len()
    }

    pub fn is_low_on_stock(&self) -> bool {
        self.low_stock_threshold
            .is_some_and(|threshold| self.remaining_quantity <= threshold)
    }

    fn sort_slots(&mut self) {
        self.reminder_slots.sort_by_key(|slot| slot.time);
    }
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(raw.trim(), FORMAT).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::WeekdayTag;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn sample() -> MedicationRegimen {
        MedicationRegimen::new(
            "ambroxol",
            "Ambroxol HCl 30mg",
            date(2024, 4, 27),
            RecurrenceRule::Daily,
        )
        .with_quantity(84, "tablet")
        .with_slot(ReminderSlot::at(18, 0, "1 tablet").unwrap())
        .with_slot(ReminderSlot::at(8, 0, "1 tablet").unwrap())
    }

    #[test]
    fn slots_are_kept_in_time_order() {
        let regimen = sample();
        let times: Vec<NaiveTime> = regimen.reminder_slots.iter().map(|s| s.time).collect();
        assert_eq!(times, vec![time(8, 0), time(18, 0)]);
    }

    #[test]
    fn validation_rejects_each_bad_field() {
        assert!(sample().validate().is_ok());

        let mut no_slots = sample();
        no_slots.reminder_slots.clear();
        assert_eq!(no_slots.validate(), Err(ConfigurationError::EmptyReminderSlots));

        let mut zero_interval = sample();
        zero_interval.recurrence_rule = RecurrenceRule::IntervalDays(0);
        assert_eq!(
            zero_interval.validate(),
            Err(ConfigurationError::NonPositiveInterval(0))
        );

        let mut no_days = sample();
        no_days.recurrence_rule = RecurrenceRule::Weekdays(Default::default());
        assert_eq!(no_days.validate(), Err(ConfigurationError::EmptyWeekdays));

        let mut duplicate = sample();
        duplicate
            .reminder_slots
            .push(ReminderSlot::at(8, 0, "2 tablets").unwrap());
        assert_eq!(
            duplicate.validate(),
            Err(ConfigurationError::DuplicateSlotTime(time(8, 0)))
        );

        let mut unnamed = sample();
        unnamed.medication_name = "  ".into();
        assert_eq!(unnamed.validate(), Err(ConfigurationError::EmptyMedicationName));
    }

    #[test]
    fn slot_edits_keep_times_unique_and_sorted() {
        let mut regimen = sample();
        regimen.upsert_slot(ReminderSlot::at(8, 0, "2 tablets").unwrap());
        assert_eq!(regimen.reminder_slots.len(), 2);
        assert_eq!(regimen.slot_at(time(8, 0)).unwrap().dosage_description, "2 tablets");

        assert!(regimen.retime_slot(time(18, 0), time(6, 30)));
        assert_eq!(regimen.reminder_slots[0].time, time(6, 30));
        assert!(!regimen.retime_slot(time(18, 0), time(19, 0)));

        assert!(regimen.remove_slot(time(6, 30)));
        assert!(!regimen.remove_slot(time(6, 30)));
        assert_eq!(regimen.reminder_slots.len(), 1);
    }

    #[test]
    fn seconds_are_dropped_from_slot_times() {
        let slot = ReminderSlot::new(NaiveTime::from_hms_opt(7, 30, 45).unwrap(), "1 tablet");
        assert_eq!(slot.time, time(7, 30));
    }

    #[test]
    fn low_stock_requires_a_threshold() {
        let mut regimen = sample();
        assert!(!regimen.is_low_on_stock());
        regimen.low_stock_threshold = Some(84);
        assert!(regimen.is_low_on_stock());
        regimen.remaining_quantity = 85;
        assert!(!regimen.is_low_on_stock());
    }

    #[test]
    fn deserializes_seed_json() {
        let raw = r#"{
            "id": "vitd",
            "medicationName": "Vitamin D3",
            "unit": "capsule",
            "remainingQuantity": 30,
            "startDate": "2024-06-03",
            "recurrenceRule": { "kind": "Weekdays", "value": ["Mon", "Thu"] },
            "reminderSlots": [ { "time": "07:30", "dosageDescription": "1 capsule" } ]
        }"#;
        let regimen: MedicationRegimen = serde_json::from_str(raw).unwrap();
        assert!(regimen.notifications_enabled);
        assert_eq!(regimen.reminder_slots[0].time, time(7, 30));
        assert_eq!(
            regimen.recurrence_rule,
            RecurrenceRule::weekdays([WeekdayTag::Mon, WeekdayTag::Thu])
        );
        assert!(regimen.is_active_date(date(2024, 6, 6)).unwrap());
        assert!(!regimen.is_active_date(date(2024, 6, 5)).unwrap());
    }
}
