use chrono::NaiveTime;
use thiserror::Error;

use crate::dose::{DoseStatus, InstanceKey};

/// A regimen that cannot be saved. Each variant names the offending field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("regimen id cannot be empty")]
    EmptyRegimenId,
    #[error("medication name cannot be empty")]
    EmptyMedicationName,
    #[error("repeat interval must be at least one day (got {0})")]
    NonPositiveInterval(u32),
    #[error("at least one weekday must be selected")]
    EmptyWeekdays,
    #[error("at least one reminder time is required")]
    EmptyReminderSlots,
    #[error("reminder time {} is listed more than once", .0.format("%H:%M"))]
    DuplicateSlotTime(NaiveTime),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read overlay store {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write overlay store {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode overlay store: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode overlay store: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid regimen configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("dose {key} is already {}", current.label())]
    InvalidTransition { key: InstanceKey, current: DoseStatus },
    #[error("no scheduled dose matches {0}")]
    UnknownInstance(InstanceKey),
    #[error("unknown regimen `{0}`")]
    UnknownRegimen(String),
    #[error("cannot consume {requested} from regimen `{regimen_id}`: only {remaining} left")]
    InsufficientQuantity {
        regimen_id: String,
        requested: u32,
        remaining: u32,
    },
    #[error("malformed instance key `{0}`")]
    InvalidInstanceKey(String),
    #[error("invalid calendar month {year}-{month}")]
    InvalidMonth { year: i32, month: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;
