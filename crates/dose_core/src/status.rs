use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::dose::{instances_for_date, DoseInstance, DoseStatus, InstanceKey, StatusOverlay};
use crate::error::{ScheduleError, ScheduleResult};
use crate::regimen::MedicationRegimen;
use crate::store::OverlayStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoseAction {
    Take,
    Cancel,
}

/// The only legal moves are `Pending -> Taken` and `Pending -> Canceled`.
///
/// On an illegal move the unchanged current status is returned as the error.
pub fn next_overlay(
    current: DoseStatus,
    action: DoseAction,
    now: NaiveDateTime,
) -> Result<StatusOverlay, DoseStatus> {
    match (current, action) {
        (DoseStatus::Pending, DoseAction::Take) => Ok(StatusOverlay::Taken { taken_at: now }),
        (DoseStatus::Pending, DoseAction::Cancel) => {
            Ok(StatusOverlay::Canceled { canceled_at: now })
        }
        (terminal, _) => Err(terminal),
    }
}

/// Owner of the overlay store: every status write goes through here.
pub struct DoseStatusMachine {
    store: Arc<dyn OverlayStore>,
    transition_lock: Mutex<()>,
}

impl DoseStatusMachine {
    pub fn new(store: Arc<dyn OverlayStore>) -> Self {
        Self {
            store,
            transition_lock: Mutex::new(()),
        }
    }

    /// Read access for the generator and the scanner.
    pub fn store(&self) -> &dyn OverlayStore {
        self.store.as_ref()
    }

    pub fn mark_taken(
        &self,
        regimen: Option<&MedicationRegimen>,
        key: &InstanceKey,
        now: NaiveDateTime,
    ) -> ScheduleResult<DoseInstance> {
        self.apply(DoseAction::Take, key, now, |_| regimen.cloned())
    }

    pub fn mark_canceled(
        &self,
        regimen: Option<&MedicationRegimen>,
        key: &InstanceKey,
        now: NaiveDateTime,
    ) -> ScheduleResult<DoseInstance> {
        self.apply(DoseAction::Cancel, key, now, |_| regimen.cloned())
    }

    /// Applies `action` to one occurrence. `resolve` looks up the owning regimen by id and
    /// runs while the transition lock is held, so it cannot race `remove_regimen`.
    #[instrument(skip(self, key, resolve), fields(key = %key))]
    pub fn apply(
        &self,
        action: DoseAction,
        key: &InstanceKey,
        now: NaiveDateTime,
        resolve: impl FnOnce(&str) -> Option<MedicationRegimen>,
    ) -> ScheduleResult<DoseInstance> {
        // Check-then-set must not interleave with another transition on the same key.
        let _guard = self.transition_lock.lock();
        let regimen = resolve(&key.regimen_id)
            .filter(|regimen| regimen.id == key.regimen_id)
            .ok_or_else(|| ScheduleError::UnknownInstance(key.clone()))?;
        let mut instance = instances_for_date(&regimen, key.date, self.store())?
            .into_iter()
            .find(|instance| instance.key == *key)
            .ok_or_else(|| ScheduleError::UnknownInstance(key.clone()))?;

        let overlay = next_overlay(instance.status, action, now).map_err(|current| {
            debug!(current = current.label(), ?action, "transition rejected");
            ScheduleError::InvalidTransition {
                key: key.clone(),
                current,
            }
        })?;
        self.store.set(key, overlay)?;
        instance.status = overlay.into();
        debug!(status = instance.status.label(), "dose status recorded");
        Ok(instance)
    }

    /// Drops a regimen's history. Waits for any in-flight transition to land first.
    pub fn remove_regimen(&self, regimen_id: &str) -> ScheduleResult<usize> {
        let _guard = self.transition_lock.lock();
        Ok(self.store.remove_regimen(regimen_id)?)
    }
}
