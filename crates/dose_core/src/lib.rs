pub mod calendar;
pub mod config;
pub mod dose;
pub mod error;
pub mod notifications;
pub mod recurrence;
pub mod regimen;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod status;
pub mod store;
pub mod window;

pub use crate::error::{ConfigurationError, ScheduleError, ScheduleResult, StoreError};
pub use crate::scheduler::{ReminderScanner, ScanHandle};
pub use crate::service::{ScheduleService, ScheduleServiceBuilder};
