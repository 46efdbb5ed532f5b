use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    calendar::{self, CalendarDay},
    config::EngineConfig,
    dose::{self, DoseInstance, InstanceKey, TimeOfDayBucket},
    error::{ScheduleError, ScheduleResult},
    notifications::NotificationSink,
    regimen::MedicationRegimen,
    source::RegimenSource,
    status::{DoseAction, DoseStatusMachine},
    store::{InMemoryOverlayStore, OverlayStore},
    window::DoseFlags,
};

/// One row of a day's schedule as consumed by the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub regimen: MedicationRegimen,
    pub instance: DoseInstance,
    pub flags: DoseFlags,
    pub bucket: TimeOfDayBucket,
}

/// Regimens seeded from the source, overlaid by local edits.
///
/// A reload replaces only the seeded layer, so local edits and deletions survive it.
#[derive(Debug, Default)]
struct RegimenBook {
    seeded: BTreeMap<String, MedicationRegimen>,
    local: BTreeMap<String, Option<MedicationRegimen>>,
}

impl RegimenBook {
    fn get(&self, id: &str) -> Option<&MedicationRegimen> {
        match self.local.get(id) {
            Some(edited) => edited.as_ref(),
            None => self.seeded.get(id),
        }
    }

    fn all(&self) -> Vec<MedicationRegimen> {
        let mut merged: BTreeMap<&str, &MedicationRegimen> = self
            .seeded
            .iter()
            .map(|(id, regimen)| (id.as_str(), regimen))
            .collect();
        for (id, edited) in &self.local {
            match edited {
                Some(regimen) => {
                    merged.insert(id.as_str(), regimen);
                }
                None => {
                    merged.remove(id.as_str());
                }
            }
        }
        merged.into_values().cloned().collect()
    }
}

pub struct ScheduleService {
    config: EngineConfig,
    regimens: RwLock<RegimenBook>,
    status: DoseStatusMachine,
    source: Option<Box<dyn RegimenSource>>,
    notification_sink: Option<Box<dyn NotificationSink>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    stale: Arc<AtomicBool>,
}

pub struct ScheduleServiceBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn OverlayStore>>,
    source: Option<Box<dyn RegimenSource>>,
    notification_sink: Option<Box<dyn NotificationSink>>,
    regimens: Vec<MedicationRegimen>,
}

impl Default for ScheduleServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleServiceBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            source: None,
            notification_sink: None,
            regimens: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_overlay_store(mut self, store: Arc<dyn OverlayStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_regimen_source(mut self, source: Box<dyn RegimenSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_notification_sink(mut self, sink: Box<dyn NotificationSink>) -> Self {
        self.notification_sink = Some(sink);
        self
    }

    /// Registers a regimen that is not backed by the source. Reloads leave it alone.
    pub fn add_regimen(mut self, regimen: MedicationRegimen) -> Self {
        self.regimens.push(regimen);
        self
    }

    pub fn build(self) -> Result<ScheduleService> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryOverlayStore::default()));
        let service = ScheduleService {
            config: self.config,
            regimens: RwLock::new(RegimenBook::default()),
            status: DoseStatusMachine::new(store),
            source: self.source,
            notification_sink: self.notification_sink,
            watcher: Mutex::new(None),
            stale: Arc::new(AtomicBool::new(false)),
        };
        service.reload_regimens()?;
        {
            let mut book = service.regimens.write();
            for regimen in accept_valid(self.regimens) {
                book.local.insert(regimen.id.clone(), Some(regimen));
            }
        }
        Ok(service)
    }
}

impl ScheduleService {
    pub fn builder() -> ScheduleServiceBuilder {
        ScheduleServiceBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn notification_sink(&self) -> Option<&dyn NotificationSink> {
        self.notification_sink.as_deref()
    }

    /// Re-reads the regimen source. Local edits are kept. Returns the seeded count.
    #[instrument(skip(self))]
    pub fn reload_regimens(&self) -> Result<usize> {
        let Some(source) = &self.source else {
            return Ok(self.regimens.read().seeded.len());
        };
        let loaded = source.load().context("failed to load regimens")?;
        let seeded: BTreeMap<String, MedicationRegimen> = accept_valid(loaded)
            .into_iter()
            .map(|regimen| (regimen.id.clone(), regimen))
            .collect();
        let count = seeded.len();
        self.regimens.write().seeded = seeded;
        self.stale.store(false, Ordering::SeqCst);
        info!(count, "regimens reloaded");
        Ok(count)
    }

    /// Reloads only when the watcher saw a change since the last reload.
    pub fn reload_if_stale(&self) -> Result<bool> {
        if !self.stale.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.reload_regimens()?;
        Ok(true)
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Watches the source's paths and marks the regimen set stale on any change.
    pub fn watch(&self) -> Result<()> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(());
        }
        let Some(source) = &self.source else {
            return Ok(());
        };
        let stale = Arc::clone(&self.stale);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    debug!(?event, "regimen source change detected");
                    stale.store(true, Ordering::SeqCst);
                }
                Err(err) => warn!(%err, "regimen watcher error"),
            }
        })?;
        for path in source.watch_paths() {
            if !path.exists() {
                continue;
            }
            let mode = if path.is_file() {
                RecursiveMode::NonRecursive
            } else {
                RecursiveMode::Recursive
            };
            watcher
                .watch(&path, mode)
                .with_context(|| format!("failed to watch {}", path.display()))?;
        }
        *slot = Some(watcher);
        Ok(())
    }

    pub fn regimens(&self) -> Vec<MedicationRegimen> {
        self.regimens.read().all()
    }

    pub fn regimen(&self, id: &str) -> Option<MedicationRegimen> {
        self.regimens.read().get(id).cloned()
    }

    /// Creates or replaces a regimen. Configuration errors block the save.
    ///
    /// Recorded history for occurrences that no longer exist is left untouched.
    #[instrument(skip(self, regimen), fields(regimen = %regimen.id))]
    pub fn save_regimen(&self, regimen: MedicationRegimen) -> ScheduleResult<()> {
        regimen.validate()?;
        self.regimens
            .write()
            .local
            .insert(regimen.id.clone(), Some(regimen));
        info!("regimen saved");
        Ok(())
    }

    /// Applies an edit to a copy of the regimen and saves it if still valid.
    pub fn update_regimen(
        &self,
        id: &str,
        edit: impl FnOnce(&mut MedicationRegimen),
    ) -> ScheduleResult<MedicationRegimen> {
        let mut book = self.regimens.write();
        let mut regimen = book
            .get(id)
            .cloned()
            .ok_or_else(|| ScheduleError::UnknownRegimen(id.to_string()))?;
        edit(&mut regimen);
        // The id is the identity of the record and cannot be edited.
        regimen.id = id.to_string();
        regimen.validate()?;
        book.local.insert(id.to_string(), Some(regimen.clone()));
        Ok(regimen)
    }

    /// Removes a regimen along with its recorded history and pending notifications.
    #[instrument(skip(self))]
    pub fn delete_regimen(&self, id: &str) -> ScheduleResult<MedicationRegimen> {
        let removed = {
            let mut book = self.regimens.write();
            let removed = book
                .get(id)
                .cloned()
                .ok_or_else(|| ScheduleError::UnknownRegimen(id.to_string()))?;
            book.local.insert(id.to_string(), None);
            removed
        };
        let cleared = self.status.remove_regimen(id)?;
        if let Some(sink) = &self.notification_sink {
            sink.clear_for_regimen(id);
        }
        info!(cleared, "regimen deleted");
        Ok(removed)
    }

    pub fn set_remaining_quantity(&self, id: &str, quantity: u32) -> ScheduleResult<u32> {
        self.update_regimen(id, |regimen| regimen.remaining_quantity = quantity)
            .map(|regimen| regimen.remaining_quantity)
    }

    /// Takes `amount` units out of the stock. Never triggered by marking a dose taken.
    pub fn consume_quantity(&self, id: &str, amount: u32) -> ScheduleResult<u32> {
        let mut book = self.regimens.write();
        let mut regimen = book
            .get(id)
            .cloned()
            .ok_or_else(|| ScheduleError::UnknownRegimen(id.to_string()))?;
        let remaining = regimen.remaining_quantity.checked_sub(amount).ok_or(
            ScheduleError::InsufficientQuantity {
                regimen_id: id.to_string(),
                requested: amount,
                remaining: regimen.remaining_quantity,
            },
        )?;
        regimen.remaining_quantity = remaining;
        book.local.insert(id.to_string(), Some(regimen));
        debug!(regimen = %id, amount, remaining, "stock consumed");
        Ok(remaining)
    }

    pub fn instances_for_date(&self, id: &str, date: NaiveDate) -> ScheduleResult<Vec<DoseInstance>> {
        let regimen = self
            .regimen(id)
            .ok_or_else(|| ScheduleError::UnknownRegimen(id.to_string()))?;
        dose::instances_for_date(&regimen, date, self.status.store())
    }

    /// Every occurrence on `date` across all regimens, with flags evaluated at `now`.
    ///
    /// Ordered by time of day, then medication name.
    pub fn schedule_for_date(
        &self,
        date: NaiveDate,
        now: NaiveDateTime,
    ) -> ScheduleResult<Vec<ScheduleEntry>> {
        let mut entries = Vec::new();
        for regimen in self.regimens() {
            let instances = dose::instances_for_date(&regimen, date, self.status.store())?;
            for instance in instances {
                let flags = DoseFlags::evaluate(
                    &instance,
                    now,
                    self.config.grace_minutes,
                    self.config.lead_minutes,
                );
                let bucket = self.config.buckets.classify(instance.key.time);
                entries.push(ScheduleEntry {
                    regimen: regimen.clone(),
                    instance,
                    flags,
                    bucket,
                });
            }
        }
        entries.sort_by(|a, b| {
            a.instance
                .key
                .time
                .cmp(&b.instance.key.time)
                .then_with(|| a.regimen.medication_name.cmp(&b.regimen.medication_name))
                .then_with(|| a.regimen.id.cmp(&b.regimen.id))
        });
        Ok(entries)
    }

    pub fn grouped_schedule(
        &self,
        date: NaiveDate,
        now: NaiveDateTime,
    ) -> ScheduleResult<Vec<(TimeOfDayBucket, Vec<ScheduleEntry>)>> {
        let entries = self.schedule_for_date(date, now)?;
        let buckets = self.config.buckets;
        Ok(dose::group_by_bucket(
            entries,
            |entry| entry.instance.key.time,
            |time| buckets.classify(time),
        ))
    }

    pub fn mark_taken(&self, key: &InstanceKey, now: NaiveDateTime) -> ScheduleResult<DoseInstance> {
        self.status
            .apply(DoseAction::Take, key, now, |id| self.regimen(id))
    }

    pub fn mark_canceled(
        &self,
        key: &InstanceKey,
        now: NaiveDateTime,
    ) -> ScheduleResult<DoseInstance> {
        self.status
            .apply(DoseAction::Cancel, key, now, |id| self.regimen(id))
    }

    /// Drops history older than the configured retention horizon.
    pub fn prune_history(&self, today: NaiveDate) -> ScheduleResult<usize> {
        let cutoff = today - Duration::days(i64::from(self.config.retention_days));
        let pruned = self.status.store().prune_before(cutoff)?;
        if pruned > 0 {
            info!(pruned, %cutoff, "history pruned");
        }
        Ok(pruned)
    }

    pub fn month_grid(&self, year: i32, month: u32) -> ScheduleResult<Vec<CalendarDay>> {
        calendar::build_month_grid(year, month)
    }
}

fn accept_valid(regimens: Vec<MedicationRegimen>) -> Vec<MedicationRegimen> {
    regimens
        .into_iter()
        .filter(|regimen| match regimen.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!(regimen = %regimen.id, %err, "skipping invalid regimen");
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dose::DoseStatus;
    use crate::recurrence::{RecurrenceRule, WeekdayTag};
    use crate::regimen::ReminderSlot;
    use chrono::NaiveTime;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn morning_and_evening() -> MedicationRegimen {
        MedicationRegimen::new("met", "Metformin", date(2024, 6, 1), RecurrenceRule::Daily)
            .with_quantity(60, "tablet")
            .with_slot(ReminderSlot::at(8, 0, "1 tablet").unwrap())
            .with_slot(ReminderSlot::at(19, 0, "1 tablet").unwrap())
    }

    fn mwf() -> MedicationRegimen {
        MedicationRegimen::new(
            "vitd",
            "Vitamin D3",
            date(2024, 6, 1),
            RecurrenceRule::weekdays([WeekdayTag::Mon, WeekdayTag::Wed, WeekdayTag::Fri]),
        )
        .with_slot(ReminderSlot::at(7, 30, "1 capsule").unwrap())
    }

    fn service() -> ScheduleService {
        ScheduleService::builder()
            .add_regimen(morning_and_evening())
            .add_regimen(mwf())
            .build()
            .expect("build schedule service")
    }

    #[test]
    fn schedule_merges_regimens_in_time_order() {
        let service = service();
        let monday = date(2024, 6, 3);
        let entries = service
            .schedule_for_date(monday, monday.and_time(time(7, 50)))
            .unwrap();
        let rows: Vec<(&str, NaiveTime)> = entries
            .iter()
            .map(|e| (e.regimen.id.as_str(), e.instance.key.time))
            .collect();
        assert_eq!(
            rows,
            vec![("vitd", time(7, 30)), ("met", time(8, 0)), ("met", time(19, 0))]
        );
        assert!(entries[1].flags.in_reminder_window);
        assert!(!entries[0].flags.overdue, "7:30 is still inside the grace period");

        let tuesday = date(2024, 6, 4);
        let entries = service
            .schedule_for_date(tuesday, tuesday.and_time(time(6, 0)))
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn grouped_schedule_uses_buckets() {
        let service = service();
        let monday = date(2024, 6, 3);
        let groups = service
            .grouped_schedule(monday, monday.and_time(time(6, 0)))
            .unwrap();
        let summary: Vec<(TimeOfDayBucket, usize)> =
            groups.iter().map(|(bucket, rows)| (*bucket, rows.len())).collect();
        assert_eq!(
            summary,
            vec![(TimeOfDayBucket::Morning, 2), (TimeOfDayBucket::Evening, 1)]
        );
    }

    #[test]
    fn invalid_regimen_cannot_be_saved() {
        let service = service();
        let mut broken = mwf();
        broken.id = "broken".into();
        broken.recurrence_rule = RecurrenceRule::IntervalDays(0);
        assert!(matches!(
            service.save_regimen(broken),
            Err(ScheduleError::Configuration(_))
        ));
        assert!(service.regimen("broken").is_none());

        let err = service
            .update_regimen("met", |regimen| regimen.reminder_slots.clear())
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Configuration(_)));
        assert_eq!(service.regimen("met").unwrap().reminder_slots.len(), 2);
    }

    #[test]
    fn retiming_a_slot_keeps_recorded_history() {
        let service = service();
        let day = date(2024, 6, 3);
        let old_key = InstanceKey::new("met", day, time(8, 0));
        service.mark_taken(&old_key, day.and_time(time(8, 5))).unwrap();

        service
            .update_regimen("met", |regimen| {
                regimen.retime_slot(time(8, 0), time(9, 0));
            })
            .unwrap();
        assert_eq!(
            service.status.store().get(&old_key).unwrap(),
            Some(crate::dose::StatusOverlay::Taken {
                taken_at: day.and_time(time(8, 5))
            })
        );
        let instances = service.instances_for_date("met", day).unwrap();
        assert_eq!(instances[0].key.time, time(9, 0));
        assert_eq!(instances[0].status, DoseStatus::Pending);
        assert!(matches!(
            service.mark_canceled(&old_key, day.and_time(time(10, 0))),
            Err(ScheduleError::UnknownInstance(_))
        ));
    }

    #[test]
    fn deleting_a_regimen_clears_its_history() {
        let service = service();
        let day = date(2024, 6, 3);
        let key = InstanceKey::new("vitd", day, time(7, 30));
        service.mark_taken(&key, day.and_time(time(7, 31))).unwrap();

        let removed = service.delete_regimen("vitd").unwrap();
        assert_eq!(removed.medication_name, "Vitamin D3");
        assert!(service.regimen("vitd").is_none());
        assert!(service.status.store().get(&key).unwrap().is_none());
        assert!(matches!(
            service.delete_regimen("vitd"),
            Err(ScheduleError::UnknownRegimen(_))
        ));
        assert!(matches!(
            service.mark_taken(&key, day.and_time(time(7, 40))),
            Err(ScheduleError::UnknownInstance(_))
        ));
    }

    #[test]
    fn take_racing_delete_leaves_no_history_for_a_recreated_regimen() {
        let day = date(2024, 6, 3);
        for _ in 0..20 {
            let service = Arc::new(service());
            let key = InstanceKey::new("vitd", day, time(7, 30));
            let taker = {
                let service = Arc::clone(&service);
                let key = key.clone();
                std::thread::spawn(move || service.mark_taken(&key, day.and_time(time(7, 31))))
            };
            service.delete_regimen("vitd").unwrap();
            let outcome = taker.join().unwrap();
            assert!(
                outcome.is_ok() || matches!(outcome, Err(ScheduleError::UnknownInstance(_))),
                "unexpected outcome {outcome:?}"
            );

            service.save_regimen(mwf()).unwrap();
            assert_eq!(
                service.instances_for_date("vitd", day).unwrap()[0].status,
                DoseStatus::Pending
            );
        }
    }

    #[test]
    fn taking_a_dose_does_not_touch_stock() {
        let service = service();
        let day = date(2024, 6, 3);
        service
            .mark_taken(&InstanceKey::new("met", day, time(8, 0)), day.and_time(time(8, 0)))
            .unwrap();
        assert_eq!(service.regimen("met").unwrap().remaining_quantity, 60);

        assert_eq!(service.consume_quantity("met", 2).unwrap(), 58);
        assert!(matches!(
            service.consume_quantity("met", 59),
            Err(ScheduleError::InsufficientQuantity { remaining: 58, .. })
        ));
        assert_eq!(service.set_remaining_quantity("met", 5).unwrap(), 5);
    }

    #[test]
    fn prune_respects_retention_horizon() {
        let service = ScheduleService::builder()
            .with_config(EngineConfig::default().with_retention_days(7))
            .add_regimen(morning_and_evening())
            .build()
            .unwrap();
        let old = date(2024, 6, 1);
        let recent = date(2024, 6, 10);
        for day in [old, recent] {
            service
                .mark_taken(&InstanceKey::new("met", day, time(8, 0)), day.and_time(time(8, 0)))
                .unwrap();
        }
        assert_eq!(service.prune_history(date(2024, 6, 12)).unwrap(), 1);
        assert_eq!(
            service.instances_for_date("met", recent).unwrap()[0].status,
            DoseStatus::Taken {
                taken_at: recent.and_time(time(8, 0))
            }
        );
    }

    #[test]
    fn invalid_seed_regimens_are_skipped() {
        let mut broken = mwf();
        broken.id = "empty".into();
        broken.reminder_slots.clear();
        let service = ScheduleService::builder()
            .add_regimen(broken)
            .add_regimen(mwf())
            .build()
            .unwrap();
        let ids: Vec<String> = service.regimens().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["vitd"]);
    }
}
