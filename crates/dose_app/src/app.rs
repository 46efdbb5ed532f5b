use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use dose_core::{
    calendar::{CalendarDay, MonthCursor},
    config::EngineConfig,
    dose::{DoseStatus, InstanceKey, TimeOfDayBucket},
    notifications::TracingNotificationSink,
    scheduler::{LocalClock, ReminderScanner, ScanSnapshot, ScanSubscriber},
    service::ScheduleEntry,
    source::DirectoryRegimenSource,
    store::JsonFileOverlayStore,
    window::describe_countdown,
    ScheduleService,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "dose_reminder")]
#[command(about = "Medication schedule and dose reminders")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show the doses scheduled on a day (today by default)
    Schedule {
        /// Day to show (YYYY-MM-DD)
        date: Option<NaiveDate>,
    },
    /// List regimens with their recurrence and stock
    Regimens,
    /// Show a month grid with the days that have doses
    Month { year: i32, month: u32 },
    /// Record a dose as taken
    Take {
        /// Occurrence key, e.g. vitd:2024-06-03:07:30
        key: String,
    },
    /// Record a dose as canceled
    Cancel { key: String },
    /// Drop recorded history older than the retention horizon
    Prune,
    /// Scan periodically and print reminders until stdin closes
    Watch,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub(crate) roots: Vec<PathBuf>,
    pub(crate) overlay_path: PathBuf,
    pub(crate) engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub(crate) fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup("DOSE_REGIMEN_ROOT") {
            self.push_root(PathBuf::from(root));
        }
        if let Some(list) = lookup("DOSE_REGIMEN_ROOTS") {
            for path in std::env::split_paths(&list) {
                self.push_root(path);
            }
        }
        if let Some(path) = lookup("DOSE_OVERLAY_PATH") {
            if !path.trim().is_empty() {
                self.overlay_path = PathBuf::from(path);
            }
        }
        if let Some(value) = parse_number::<u32>(lookup("DOSE_GRACE_MINUTES")) {
            self.engine.grace_minutes = value;
        }
        if let Some(value) = parse_number::<u32>(lookup("DOSE_LEAD_MINUTES")) {
            self.engine.lead_minutes = value;
        }
        if let Some(value) = parse_number::<u64>(lookup("DOSE_SCAN_INTERVAL_SECS")) {
            if value > 0 {
                self.engine.scan_interval = StdDuration::from_secs(value);
            }
        }
        if let Some(value) = parse_number::<u32>(lookup("DOSE_RETENTION_DAYS")) {
            self.engine.retention_days = value;
        }
    }

    pub(crate) fn push_root(&mut self, path: PathBuf) {
        if !self.roots.contains(&path) {
            info!(path = %path.display(), "registering regimen root");
            self.roots.push(path);
        }
    }

    pub fn build_service(&self) -> Result<ScheduleService> {
        let mut source = DirectoryRegimenSource::new();
        for root in &self.roots {
            source = source.add_root(root);
        }
        let store = JsonFileOverlayStore::open(&self.overlay_path).with_context(|| {
            format!("failed to open overlay store {}", self.overlay_path.display())
        })?;
        ScheduleService::builder()
            .with_config(self.engine.clone())
            .with_regimen_source(Box::new(source))
            .with_overlay_store(Arc::new(store))
            .with_notification_sink(Box::new(TracingNotificationSink))
            .build()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            overlay_path: PathBuf::from("dose-overlays.json"),
            engine: EngineConfig::default(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|value| value.trim().parse::<T>().ok())
}

pub fn run(config: AppConfig, command: Option<Command>) -> Result<()> {
    info!(
        roots = config.roots.len(),
        overlay = %config.overlay_path.display(),
        "starting dose reminder"
    );
    let service = Arc::new(config.build_service()?);
    let command = command.unwrap_or(Command::Schedule { date: None });
    if command == Command::Watch {
        return watch(service);
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    execute(&service, command, Local::now().naive_local(), &mut out)
}

/// Runs a one-shot command against `service` as of `now`.
pub fn execute(
    service: &ScheduleService,
    command: Command,
    now: NaiveDateTime,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        Command::Schedule { date } => {
            let date = date.unwrap_or(now.date());
            let groups = service.grouped_schedule(date, now)?;
            write!(out, "{}", render_schedule(date, now, &groups))?;
        }
        Command::Regimens => {
            for regimen in service.regimens() {
                let stock = if regimen.is_low_on_stock() {
                    " (low stock)"
                } else {
                    ""
                };
                let times: Vec<String> = regimen
                    .reminder_slots
                    .iter()
                    .map(|slot| slot.time.format("%H:%M").to_string())
                    .collect();
                writeln!(
                    out,
                    "{}  {}  {} at {}  {} {} left{stock}",
                    regimen.id,
                    regimen.medication_name,
                    regimen.recurrence_rule.label(),
                    times.join(", "),
                    regimen.remaining_quantity,
                    regimen.unit,
                )?;
            }
        }
        Command::Month { year, month } => {
            let cursor = MonthCursor::new(year, month)?;
            let grid = cursor.grid()?;
            let mut dosing_days = Vec::new();
            for day in &grid {
                if !service.schedule_for_date(day.date, now)?.is_empty() {
                    dosing_days.push(day.date);
                }
            }
            write!(
                out,
                "{}",
                render_month(&cursor, &grid, now.date(), &dosing_days)
            )?;
        }
        Command::Take { key } => {
            let key: InstanceKey = key.parse()?;
            let instance = service.mark_taken(&key, now)?;
            writeln!(
                out,
                "{} {} marked {}",
                instance.medication_name,
                key.time.format("%H:%M"),
                instance.status.label()
            )?;
        }
        Command::Cancel { key } => {
            let key: InstanceKey = key.parse()?;
            let instance = service.mark_canceled(&key, now)?;
            writeln!(
                out,
                "{} {} marked {}",
                instance.medication_name,
                key.time.format("%H:%M"),
                instance.status.label()
            )?;
        }
        Command::Prune => {
            let pruned = service.prune_history(now.date())?;
            writeln!(out, "pruned {pruned} recorded doses")?;
        }
        Command::Watch => anyhow::bail!("watch needs the interactive runner"),
    }
    Ok(())
}

struct PrintingSubscriber;

impl ScanSubscriber for PrintingSubscriber {
    fn publish(&self, snapshot: &ScanSnapshot) {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for reminder in &snapshot.reminders {
            let _ = writeln!(
                out,
                "reminder: {} {} at {}",
                reminder.medication_name,
                reminder.dosage_description,
                reminder.scheduled_for.format("%H:%M")
            );
        }
        let overdue = snapshot.overdue().count();
        if overdue > 0 {
            let _ = writeln!(out, "{overdue} dose(s) overdue");
        }
    }
}

fn watch(service: Arc<ScheduleService>) -> Result<()> {
    service.watch()?;
    let scanner = Arc::new(ReminderScanner::new(service));
    scanner.subscribe(Arc::new(PrintingSubscriber));
    let mut handle = scanner.spawn(Arc::new(LocalClock))?;
    println!("watching for due doses; press q or close stdin to stop");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().eq_ignore_ascii_case("q") {
            break;
        }
    }
    handle.stop();
    Ok(())
}

pub fn render_schedule(
    date: NaiveDate,
    now: NaiveDateTime,
    groups: &[(TimeOfDayBucket, Vec<ScheduleEntry>)],
) -> String {
    let mut text = format_day_heading(date, now.date());
    text.push('\n');
    if groups.is_empty() {
        text.push_str("  no doses scheduled\n");
        return text;
    }
    for (bucket, entries) in groups {
        text.push_str(bucket.label());
        text.push('\n');
        for entry in entries {
            text.push_str(&render_entry(entry));
            text.push('\n');
        }
    }
    text
}

fn render_entry(entry: &ScheduleEntry) -> String {
    let instance = &entry.instance;
    let (mark, note) = match instance.status {
        DoseStatus::Taken { taken_at } => ("x", format!("taken {}", taken_at.format("%H:%M"))),
        DoseStatus::Canceled { .. } => ("-", "canceled".to_string()),
        DoseStatus::Pending => {
            let countdown = describe_countdown(chrono::Duration::minutes(
                entry.flags.minutes_until_due,
            ));
            if entry.flags.overdue {
                ("!", format!("overdue, {countdown}"))
            } else {
                (" ", countdown)
            }
        }
    };
    format!(
        "  [{mark}] {}  {} ({})  {note}  <{}>",
        instance.key.time.format("%H:%M"),
        instance.medication_name,
        instance.dosage_description,
        instance.key
    )
}

pub fn render_month(
    cursor: &MonthCursor,
    grid: &[CalendarDay],
    today: NaiveDate,
    dosing_days: &[NaiveDate],
) -> String {
    let mut text = format!("{}\n Mo  Tu  We  Th  Fr  Sa  Su\n", cursor.title());
    for week in grid.chunks(7) {
        let row: Vec<String> = week
            .iter()
            .map(|day| {
                let number = if day.is_current_month {
                    format!("{:>2}", chrono::Datelike::day(&day.date))
                } else {
                    " .".to_string()
                };
                let marker = if day.date == today {
                    '*'
                } else if day.is_current_month && dosing_days.contains(&day.date) {
                    '+'
                } else {
                    ' '
                };
                format!("{number}{marker}")
            })
            .collect();
        text.push_str(row.join(" ").trim_end());
        text.push('\n');
    }
    text
}

fn format_day_heading(date: NaiveDate, today: NaiveDate) -> String {
    let calendar = date.format("%A, %B %d, %Y");
    let relative = format_relative_label(date, today);
    format!("{calendar} ({relative})")
}

fn format_relative_label(date: NaiveDate, today: NaiveDate) -> String {
    let diff = date.signed_duration_since(today).num_days();
    match diff {
        -1 => "Yesterday".to_string(),
        0 => "Today".to_string(),
        1 => "Tomorrow".to_string(),
        d if d < 0 => format!("{} days ago", -d),
        d => format!("In {} days", d),
    }
}
