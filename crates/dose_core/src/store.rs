use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};

use crate::dose::{InstanceKey, StatusOverlay};
use crate::error::StoreError;

/// Key-value contract for persisted status overlays.
///
/// Each call on a single key is atomic: readers observe either the old or the new
/// overlay, never a partial write.
pub trait OverlayStore: Send + Sync {
    fn get(&self, key: &InstanceKey) -> Result<Option<StatusOverlay>, StoreError>;
    fn set(&self, key: &InstanceKey, overlay: StatusOverlay) -> Result<(), StoreError>;
    /// Drops every overlay recorded for a regimen. Returns how many were removed.
    fn remove_regimen(&self, regimen_id: &str) -> Result<usize, StoreError>;
    /// Drops overlays for dates strictly before `date`. Returns how many were removed.
    fn prune_before(&self, date: NaiveDate) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryOverlayStore {
    overlays: RwLock<HashMap<InstanceKey, StatusOverlay>>,
}

impl InMemoryOverlayStore {
    pub fn len(&self) -> usize {
        self.overlays.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.read().is_empty()
    }
}

impl OverlayStore for InMemoryOverlayStore {
    fn get(&self, key: &InstanceKey) -> Result<Option<StatusOverlay>, StoreError> {
        Ok(self.overlays.read().get(key).copied())
    }

    fn set(&self, key: &InstanceKey, overlay: StatusOverlay) -> Result<(), StoreError> {
        self.overlays.write().insert(key.clone(), overlay);
        Ok(())
    }

    fn remove_regimen(&self, regimen_id: &str) -> Result<usize, StoreError> {
        let mut overlays = self.overlays.write();
        let before = overlays.len();
        overlays.retain(|key, _| key.regimen_id != regimen_id);
        Ok(before - overlays.len())
    }

    fn prune_before(&self, date: NaiveDate) -> Result<usize, StoreError> {
        let mut overlays = self.overlays.write();
        let before = overlays.len();
        overlays.retain(|key, _| key.date >= date);
        Ok(before - overlays.len())
    }
}

/// Overlay store persisted as a single JSON object keyed by `regimenId:date:time`.
///
/// The whole map is rewritten on every mutation; a missing file is an empty store.
pub struct JsonFileOverlayStore {
    path: PathBuf,
    overlays: RwLock<HashMap<InstanceKey, StatusOverlay>>,
    write_lock: Mutex<()>,
}

impl JsonFileOverlayStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let overlays = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw).map_err(StoreError::Decode)?
            }
        } else {
            HashMap::new()
        };
        tracing::debug!(path = %path.display(), count = overlays.len(), "overlay store opened");
        Ok(Self {
            path,
            overlays: RwLock::new(overlays),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate<R>(
        &self,
        change: impl FnOnce(&mut HashMap<InstanceKey, StatusOverlay>) -> R,
    ) -> Result<R, StoreError> {
        // Serializes writers so the file always matches the latest map.
        let _guard = self.write_lock.lock();
        let mut next = self.overlays.read().clone();
        let result = change(&mut next);
        self.flush(&next)?;
        *self.overlays.write() = next;
        Ok(result)
    }

    fn flush(&self, overlays: &HashMap<InstanceKey, StatusOverlay>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let payload = serde_json::to_string_pretty(overlays).map_err(StoreError::Encode)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, payload).map_err(|source| StoreError::Write {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl OverlayStore for JsonFileOverlayStore {
    fn get(&self, key: &InstanceKey) -> Result<Option<StatusOverlay>, StoreError> {
        Ok(self.overlays.read().get(key).copied())
    }

    fn set(&self, key: &InstanceKey, overlay: StatusOverlay) -> Result<(), StoreError> {
        self.mutate(|overlays| {
            overlays.insert(key.clone(), overlay);
        })
    }

    fn remove_regimen(&self, regimen_id: &str) -> Result<usize, StoreError> {
        self.mutate(|overlays| {
            let before = overlays.len();
            overlays.retain(|key, _| key.regimen_id != regimen_id);
            before - overlays.len()
        })
    }

    fn prune_before(&self, date: NaiveDate) -> Result<usize, StoreError> {
        self.mutate(|overlays| {
            let before = overlays.len();
            overlays.retain(|key, _| key.date >= date);
            before - overlays.len()
        })
    }
}
