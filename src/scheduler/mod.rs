//! Background settlement and reminder jobs.
//!
//! The [`Scheduler`] is an ordinary value owned by whoever starts it. Each
//! job gets one worker thread that sleeps until the job's next daily run
//! time. Timer ticks and manual [`Scheduler::trigger`] calls share an
//! in-flight guard, so a job never runs twice at once; a call that finds
//! the job busy is skipped rather than queued.

pub mod jobs;
pub mod schedule;

pub use jobs::{check_reminders, check_settlements, ReminderSummary, SettlementCheckSummary};
pub use schedule::{DailyTime, ScheduleError, DEFAULT_REMINDER_TIME, DEFAULT_SETTLEMENT_TIME};

use crate::config::Settings;
use crate::lifecycle::SettlementManager;
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SettlementCheck,
    ReminderCheck,
}

impl JobKind {
    pub fn id(&self) -> &'static str {
        match self {
            JobKind::SettlementCheck => "settlement_check",
            JobKind::ReminderCheck => "reminder_check",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::SettlementCheck => "Daily settlement check",
            JobKind::ReminderCheck => "Settlement reminder check",
        }
    }
}

/// Daily run times, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub settlement_time: DailyTime,
    pub reminder_time: DailyTime,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ScheduleError> {
        Ok(Self {
            settlement_time: settings.scheduler_settlement_time.parse()?,
            reminder_time: settings.scheduler_reminder_time.parse()?,
        })
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            settlement_time: DEFAULT_SETTLEMENT_TIME,
            reminder_time: DEFAULT_REMINDER_TIME,
        }
    }
}

/// Result of one job execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobReport {
    Settlements(SettlementCheckSummary),
    Reminders(ReminderSummary),
}

impl JobReport {
    pub fn run_id(&self) -> Uuid {
        match self {
            JobReport::Settlements(s) => s.run_id,
            JobReport::Reminders(r) => r.run_id,
        }
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobReport::Settlements(s) => fmt::Display::fmt(s, f),
            JobReport::Reminders(r) => fmt::Display::fmt(r, f),
        }
    }
}

/// Bookkeeping for the most recent execution of a job.
#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: &'static str,
    pub name: &'static str,
    pub run_time: DailyTime,
    /// `None` while the scheduler is stopped.
    pub next_run: Option<DateTime<Utc>>,
    pub in_flight: bool,
    pub last_run: Option<LastRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub jobs: Vec<JobStatus>,
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Scheduler ===")?;
        write!(f, "Running: {}", if self.running { "yes" } else { "no" })?;
        for job in &self.jobs {
            write!(f, "\n\n{} ({})", job.name, job.id)?;
            write!(f, "\n  Runs daily at:  {} UTC", job.run_time)?;
            match job.next_run {
                Some(at) => write!(f, "\n  Next run:      {}", at.format("%Y-%m-%d %H:%M:%S"))?,
                None => write!(f, "\n  Next run:      -")?,
            }
            if job.in_flight {
                write!(f, "\n  Currently running")?;
            }
            if let Some(last) = &job.last_run {
                write!(
                    f,
                    "\n  Last run:      {} ({})",
                    last.started_at.format("%Y-%m-%d %H:%M:%S"),
                    last.run_id
                )?;
            }
        }
        Ok(())
    }
}

struct Job {
    kind: JobKind,
    run_time: DailyTime,
    in_flight: AtomicBool,
    last_run: Mutex<Option<LastRun>>,
}

/// Clears the in-flight flag when the run ends, panics included.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Job {
    fn run(&self, manager: &SettlementManager) -> Option<JobReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("{} is already running; skipping this run", self.kind.id());
            return None;
        }
        let _guard = InFlight(&self.in_flight);

        let report = match self.kind {
            JobKind::SettlementCheck => JobReport::Settlements(check_settlements(manager)),
            JobKind::ReminderCheck => JobReport::Reminders(check_reminders(manager)),
        };
        let started_at = match &report {
            JobReport::Settlements(s) => s.started_at,
            JobReport::Reminders(r) => r.started_at,
        };
        *self.last_run.lock() = Some(LastRun {
            run_id: report.run_id(),
            started_at,
            finished_at: manager.context().now(),
            summary: report.to_string(),
        });
        Some(report)
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    manager: Arc<SettlementManager>,
    jobs: Vec<Arc<Job>>,
    workers: Mutex<Vec<Worker>>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(manager: Arc<SettlementManager>, config: SchedulerConfig) -> Self {
        let job = |kind, run_time| {
            Arc::new(Job {
                kind,
                run_time,
                in_flight: AtomicBool::new(false),
                last_run: Mutex::new(None),
            })
        };
        Self {
            manager,
            jobs: vec![
                job(JobKind::SettlementCheck, config.settlement_time),
                job(JobKind::ReminderCheck, config.reminder_time),
            ],
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn one worker per job.
    pub fn start(&self) -> Result<(), ScheduleError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ScheduleError::AlreadyRunning);
        }
        let mut workers = self.workers.lock();
        for job in &self.jobs {
            let (stop, stopped) = mpsc::channel::<()>();
            let job = Arc::clone(job);
            let manager = Arc::clone(&self.manager);
            let spawned = thread::Builder::new()
                .name(format!("scheduler-{}", job.kind.id()))
                .spawn(move || loop {
                    let now = manager.context().now();
                    let next = job.run_time.next_run(now);
                    let wait = (next - now).to_std().unwrap_or(StdDuration::ZERO);
                    match stopped.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {
                            job.run(&manager);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                });
            match spawned {
                Ok(handle) => workers.push(Worker { stop, handle }),
                Err(e) => {
                    drop(workers);
                    self.stop();
                    return Err(ScheduleError::Spawn(e.to_string()));
                }
            }
        }
        info!(
            "scheduler started: settlement check at {} UTC, reminders at {} UTC",
            self.jobs[0].run_time, self.jobs[1].run_time
        );
        Ok(())
    }

    /// Signal every worker and wait for it to exit. A run in progress
    /// finishes first.
    pub fn stop(&self) {
        let workers: Vec<Worker> = self.workers.lock().drain(..).collect();
        for worker in &workers {
            let _ = worker.stop.send(());
        }
        for worker in workers {
            if worker.handle.join().is_err() {
                warn!("scheduler worker panicked");
            }
        }
        if self.running.swap(false, Ordering::AcqRel) {
            info!("scheduler stopped");
        }
    }

    /// Run a job now on the calling thread. Returns `None` if it is
    /// already running.
    pub fn trigger(&self, kind: JobKind) -> Option<JobReport> {
        let job = self.jobs.iter().find(|j| j.kind == kind)?;
        info!("manual trigger of {}", kind.id());
        job.run(&self.manager)
    }

    pub fn status(&self) -> SchedulerStatus {
        let running = self.is_running();
        let now = self.manager.context().now();
        SchedulerStatus {
            running,
            jobs: self
                .jobs
                .iter()
                .map(|job| JobStatus {
                    id: job.kind.id(),
                    name: job.kind.name(),
                    run_time: job.run_time,
                    next_run: running.then(|| job.run_time.next_run(now)),
                    in_flight: job.in_flight.load(Ordering::Acquire),
                    last_run: job.last_run.lock().clone(),
                })
                .collect(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
