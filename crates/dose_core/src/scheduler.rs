//! Periodic scan that re-evaluates today's doses and fans the result out to subscribers.
//!
//! A scan that has been stopped never publishes, even when the stop request arrives from
//! inside a subscriber callback of the same scan.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    dose::InstanceKey,
    error::ScheduleResult,
    notifications::{DoseReminder, LowStockAlert},
    service::{ScheduleEntry, ScheduleService},
};

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Wall clock in the device's local time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Idle,
    Scanning,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanWarning {
    /// The clock reported an instant earlier than the previous scan.
    ClockSkew {
        previous: NaiveDateTime,
        observed: NaiveDateTime,
    },
}

/// Everything one scan produced, as handed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanSnapshot {
    pub scanned_at: NaiveDateTime,
    pub entries: Vec<ScheduleEntry>,
    pub reminders: Vec<DoseReminder>,
    pub warnings: Vec<ScanWarning>,
}

impl ScanSnapshot {
    pub fn date(&self) -> NaiveDate {
        self.scanned_at.date()
    }

    pub fn overdue(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.iter().filter(|entry| entry.flags.overdue)
    }
}

pub trait ScanSubscriber: Send + Sync {
    fn publish(&self, snapshot: &ScanSnapshot);
}

/// Forwards snapshots into a channel. Dropped receivers are ignored.
pub struct ChannelSubscriber {
    sender: Mutex<Sender<ScanSnapshot>>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, Receiver<ScanSnapshot>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl ScanSubscriber for ChannelSubscriber {
    fn publish(&self, snapshot: &ScanSnapshot) {
        if self.sender.lock().send(snapshot.clone()).is_err() {
            debug!("scan receiver dropped");
        }
    }
}

#[derive(Debug, Default)]
struct ScanMemory {
    last_now: Option<NaiveDateTime>,
    last_overdue: HashSet<InstanceKey>,
    reminded: HashSet<InstanceKey>,
    low_stock_alerted: HashSet<(String, NaiveDate)>,
}

impl ScanMemory {
    /// Forgets dispatch bookkeeping for days that can no longer be scanned.
    fn forget_before(&mut self, date: NaiveDate) {
        self.reminded.retain(|key| key.date >= date);
        self.low_stock_alerted.retain(|(_, day)| *day >= date);
    }
}

pub struct ReminderScanner {
    service: Arc<ScheduleService>,
    subscribers: RwLock<Vec<Arc<dyn ScanSubscriber>>>,
    cancelled: AtomicBool,
    scan_lock: ReentrantMutex<RefCell<ScanMemory>>,
    state: Mutex<ScanState>,
}

impl ReminderScanner {
    pub fn new(service: Arc<ScheduleService>) -> Self {
        Self {
            service,
            subscribers: RwLock::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            scan_lock: ReentrantMutex::new(RefCell::new(ScanMemory::default())),
            state: Mutex::new(ScanState::Idle),
        }
    }

    pub fn service(&self) -> &Arc<ScheduleService> {
        &self.service
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ScanSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn subscribe_channel(&self) -> Receiver<ScanSnapshot> {
        let (subscriber, receiver) = ChannelSubscriber::new();
        self.subscribe(Arc::new(subscriber));
        receiver
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs one scan at `now`. Returns `None` when the scanner was stopped first.
    #[instrument(skip(self))]
    pub fn tick(&self, now: NaiveDateTime) -> ScheduleResult<Option<ScanSnapshot>> {
        let memory = self.scan_lock.lock();
        if self.is_stopped() {
            return Ok(None);
        }
        self.set_state(ScanState::Scanning);

        let result = self.scan(&memory, now);
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.settle_state();
                return Err(err);
            }
        };

        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            if self.is_stopped() {
                debug!("scan stopped before publishing");
                break;
            }
            subscriber.publish(&snapshot);
        }
        self.settle_state();
        drop(memory);
        Ok(Some(snapshot))
    }

    /// Stops scanning. Blocks until an in-flight scan on another thread finishes.
    ///
    /// Safe to call from inside a subscriber; the current scan then publishes to no one else.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _memory = self.scan_lock.lock();
        let mut state = self.state.lock();
        if *state != ScanState::Stopped {
            *state = ScanState::Stopped;
            info!("reminder scanner stopped");
        }
    }

    /// Starts scanning every `scan_interval` on a dedicated thread.
    pub fn spawn(self: &Arc<Self>, clock: Arc<dyn Clock>) -> Result<ScanHandle> {
        let scanner = Arc::clone(self);
        let wake = Arc::new((Mutex::new(()), Condvar::new()));
        let thread_wake = Arc::clone(&wake);
        let interval = self.service.config().scan_interval;
        let thread = thread::Builder::new()
            .name("reminder-scan".into())
            .spawn(move || {
                let (lock, signal) = &*thread_wake;
                loop {
                    if let Err(err) = scanner.tick(clock.now()) {
                        warn!(%err, "reminder scan failed");
                    }
                    let mut guard = lock.lock();
                    if scanner.is_stopped() {
                        break;
                    }
                    signal.wait_for(&mut guard, interval);
                    if scanner.is_stopped() {
                        break;
                    }
                }
                debug!("reminder scan thread exiting");
            })
            .context("failed to spawn reminder scan thread")?;
        info!(?interval, "reminder scanner started");
        Ok(ScanHandle {
            scanner: Arc::clone(self),
            wake,
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    fn set_state(&self, next: ScanState) {
        let mut state = self.state.lock();
        if *state != ScanState::Stopped {
            *state = next;
        }
    }

    fn settle_state(&self) {
        if !self.is_stopped() {
            self.set_state(ScanState::Idle);
        }
    }

    fn scan(
        &self,
        memory: &RefCell<ScanMemory>,
        now: NaiveDateTime,
    ) -> ScheduleResult<ScanSnapshot> {
        if let Err(err) = self.service.reload_if_stale() {
            warn!(error = %format!("{err:#}"), "keeping previous regimens");
        }

        let today = now.date();
        let mut entries = self.service.schedule_for_date(today, now)?;
        // Windows of doses just after midnight open on the previous day.
        let lead = Duration::minutes(i64::from(self.service.config().lead_minutes));
        let early: Vec<ScheduleEntry> = match today.succ_opt() {
            Some(tomorrow) if (now + lead).date() > today => self
                .service
                .schedule_for_date(tomorrow, now)?
                .into_iter()
                .filter(|entry| entry.flags.in_reminder_window)
                .collect(),
            _ => Vec::new(),
        };
        let mut warnings = Vec::new();
        let mut reminders = Vec::new();
        let mut low_stock = Vec::new();
        {
            let mut memory = memory.borrow_mut();
            let skewed = memory.last_now.filter(|previous| now < *previous);
            match skewed {
                Some(previous) => {
                    warn!(%previous, observed = %now, "clock moved backwards; keeping previous overdue flags");
                    for entry in &mut entries {
                        entry.flags.overdue = entry.instance.status.is_pending()
                            && memory.last_overdue.contains(&entry.instance.key);
                    }
                    warnings.push(ScanWarning::ClockSkew {
                        previous,
                        observed: now,
                    });
                }
                None => {
                    for entry in entries.iter().chain(&early) {
                        if entry.flags.in_reminder_window
                            && entry.regimen.notifications_enabled
                            && memory.reminded.insert(entry.instance.key.clone())
                        {
                            reminders.push(DoseReminder {
                                key: entry.instance.key.clone(),
                                medication_name: entry.instance.medication_name.clone(),
                                dosage_description: entry.instance.dosage_description.clone(),
                                scheduled_for: entry.instance.scheduled_at(),
                            });
                        }
                    }
                    for regimen in self.service.regimens() {
                        if regimen.notifications_enabled
                            && regimen.is_low_on_stock()
                            && memory
                                .low_stock_alerted
                                .insert((regimen.id.clone(), today))
                        {
                            low_stock.push(LowStockAlert {
                                regimen_id: regimen.id,
                                medication_name: regimen.medication_name,
                                remaining_quantity: regimen.remaining_quantity,
                                unit: regimen.unit,
                                date: today,
                            });
                        }
                    }
                }
            }
            memory.last_overdue = entries
                .iter()
                .filter(|entry| entry.flags.overdue)
                .map(|entry| entry.instance.key.clone())
                .collect();
            memory.last_now = Some(now);
            memory.forget_before(today - Duration::days(1));
        }

        if let Some(sink) = self.service.notification_sink() {
            for reminder in &reminders {
                if self.is_stopped() {
                    break;
                }
                sink.dispatch(reminder.clone());
            }
            for alert in low_stock {
                if self.is_stopped() {
                    break;
                }
                sink.low_stock(alert);
            }
        }

        debug!(
            entries = entries.len(),
            reminders = reminders.len(),
            "scan complete"
        );
        Ok(ScanSnapshot {
            scanned_at: now,
            entries,
            reminders,
            warnings,
        })
    }
}

/// Owns the scan thread. Stopping (or dropping) the handle stops the scanner.
pub struct ScanHandle {
    scanner: Arc<ReminderScanner>,
    wake: Arc<(Mutex<()>, Condvar)>,
    thread_id: ThreadId,
    thread: Option<JoinHandle<()>>,
}

impl ScanHandle {
    pub fn scanner(&self) -> &Arc<ReminderScanner> {
        &self.scanner
    }

    /// Returns once no further snapshot can be published.
    pub fn stop(&mut self) {
        self.scanner.stop();
        {
            let (lock, signal) = &*self.wake;
            let _guard = lock.lock();
            signal.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread::current().id() == self.thread_id {
                return;
            }
            if thread.join().is_err() {
                warn!("reminder scan thread panicked");
            }
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
