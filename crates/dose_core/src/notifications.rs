use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::dose::InstanceKey;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DoseReminder {
    pub key: InstanceKey,
    pub medication_name: String,
    pub dosage_description: String,
    pub scheduled_for: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LowStockAlert {
    pub regimen_id: String,
    pub medication_name: String,
    pub remaining_quantity: u32,
    pub unit: String,
    pub date: NaiveDate,
}

/// Platform-specific notification adapters will implement this trait.
pub trait NotificationSink: Send + Sync {
    fn dispatch(&self, reminder: DoseReminder);
    fn low_stock(&self, alert: LowStockAlert);
    fn clear_for_regimen(&self, regimen_id: &str);
}

/// Sink that only logs; the default when no platform adapter is installed.
#[derive(Debug, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn dispatch(&self, reminder: DoseReminder) {
        tracing::info!(
            key = %reminder.key,
            medication = %reminder.medication_name,
            dosage = %reminder.dosage_description,
            scheduled_for = %reminder.scheduled_for,
            "dose reminder"
        );
    }

    fn low_stock(&self, alert: LowStockAlert) {
        tracing::info!(
            regimen = %alert.regimen_id,
            medication = %alert.medication_name,
            remaining = alert.remaining_quantity,
            unit = %alert.unit,
            "medication running low"
        );
    }

    fn clear_for_regimen(&self, regimen_id: &str) {
        tracing::debug!(regimen = %regimen_id, "cleared pending notifications");
    }
}
