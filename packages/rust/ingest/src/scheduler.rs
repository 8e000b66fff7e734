//! Interval scheduler with per-job mutual exclusion.
//!
//! Each job runs on its own timer task. A tick that finds the previous run of
//! the same job still in progress is logged and skipped, never queued. Manual
//! runs ([`Scheduler::run_now`], [`Scheduler::run_all`]) go through the same guard.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use strata_shared::{Result, StrataError};

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// A recurring cadence at minute, hour or day granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    EveryMinutes(u64),
    EveryHours(u64),
    EveryDays(u64),
}

impl Schedule {
    /// Round an arbitrary interval down to the nearest supported granularity.
    ///
    /// Anything under a minute becomes "every minute".
    pub fn from_interval(interval: Duration) -> Self {
        let minutes = (interval.as_millis() / 60_000) as u64;
        if minutes < 1 {
            return Self::EveryMinutes(1);
        }
        if minutes < 60 {
            return Self::EveryMinutes(minutes);
        }
        let hours = minutes / 60;
        if hours < 24 {
            return Self::EveryHours(hours);
        }
        Self::EveryDays(hours / 24)
    }

    /// Cron expression for this cadence.
    pub fn expression(&self) -> String {
        match *self {
            Self::EveryMinutes(1) => "* * * * *".to_string(),
            Self::EveryMinutes(n) => format!("*/{n} * * * *"),
            Self::EveryHours(1) => "0 * * * *".to_string(),
            Self::EveryHours(n) => format!("0 */{n} * * *"),
            Self::EveryDays(1) => "0 0 * * *".to_string(),
            Self::EveryDays(n) => format!("0 0 */{n} * *"),
        }
    }

    /// Time between runs.
    pub fn period(&self) -> Duration {
        match *self {
            Self::EveryMinutes(n) => Duration::from_secs(n * 60),
            Self::EveryHours(n) => Duration::from_secs(n * 3600),
            Self::EveryDays(n) => Duration::from_secs(n * 86_400),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// The work a job performs on each run.
pub type JobTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// What happened to a requested run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// The previous run of the same job had not finished.
    Skipped,
}

struct Job {
    name: String,
    schedule: Schedule,
    task: JobTask,
    running: AtomicBool,
    runs: AtomicU64,
    skips: AtomicU64,
}

/// Clears the running flag even if the task panics.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn run_job(job: Arc<Job>) -> RunOutcome {
    if job
        .running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        job.skips.fetch_add(1, Ordering::Relaxed);
        warn!(job = %job.name, "previous run still in progress, skipping");
        return RunOutcome::Skipped;
    }

    let _guard = RunningGuard(&job.running);
    debug!(job = %job.name, "job run started");
    (job.task)().await;
    job.runs.fetch_add(1, Ordering::Relaxed);
    RunOutcome::Completed
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub name: String,
    pub schedule: Schedule,
    pub running: bool,
    pub runs: u64,
    pub skips: u64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Runs registered jobs, each on its own cadence.
pub struct Scheduler {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    loops: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: RwLock::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    /// Register (or replace) a recurring job.
    ///
    /// The interval is rounded down with [`Schedule::from_interval`]. If the
    /// scheduler is already running the job's timer starts immediately.
    pub async fn schedule(&self, name: impl Into<String>, interval: Duration, task: JobTask) {
        let name = name.into();
        let schedule = Schedule::from_interval(interval);
        let job = Arc::new(Job {
            name: name.clone(),
            schedule,
            task,
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            skips: AtomicU64::new(0),
        });

        info!(job = %name, schedule = %schedule, "job scheduled");
        self.jobs.write().await.insert(name.clone(), job.clone());

        if self.started.load(Ordering::Acquire) {
            self.spawn_loop(job).await;
        }
    }

    /// Start every registered job's timer. Calling it twice is a no-op.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(false);

        let jobs: Vec<Arc<Job>> = self.jobs.read().await.values().cloned().collect();
        for job in jobs {
            self.spawn_loop(job).await;
        }
        info!("scheduler started");
    }

    /// Stop scheduling new runs. Runs already in flight are not interrupted.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Run one job now, outside its cadence.
    pub async fn run_now(&self, name: &str) -> Result<RunOutcome> {
        let job = self
            .jobs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::validation(format!("unknown job: {name}")))?;
        Ok(run_job(job).await)
    }

    /// Run every job now, concurrently.
    pub async fn run_all(&self) -> Vec<(String, RunOutcome)> {
        let jobs: Vec<Arc<Job>> = self.jobs.read().await.values().cloned().collect();
        let names: Vec<String> = jobs.iter().map(|j| j.name.clone()).collect();
        let outcomes = join_all(jobs.into_iter().map(run_job)).await;
        names.into_iter().zip(outcomes).collect()
    }

    /// Status of every job, ordered by name.
    pub async fn jobs(&self) -> Vec<JobStatus> {
        let mut statuses: Vec<JobStatus> = self
            .jobs
            .read()
            .await
            .values()
            .map(|job| JobStatus {
                name: job.name.clone(),
                schedule: job.schedule,
                running: job.running.load(Ordering::Acquire),
                runs: job.runs.load(Ordering::Relaxed),
                skips: job.skips.load(Ordering::Relaxed),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    async fn spawn_loop(&self, job: Arc<Job>) {
        let mut shutdown = self.shutdown.subscribe();
        let name = job.name.clone();

        let handle = tokio::spawn(async move {
            let period = job.schedule.period();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Each run gets its own task so a slow run never holds up the timer.
                        tokio::spawn(run_job(job.clone()));
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(job = %job.name, "job loop exited");
        });

        if let Some(previous) = self.loops.lock().await.insert(name, handle) {
            previous.abort();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_task(counter: Arc<AtomicUsize>, delay: Duration) -> JobTask {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn sub_minute_intervals_degrade_to_every_minute() {
        assert_eq!(
            Schedule::from_interval(Duration::from_secs(30)),
            Schedule::EveryMinutes(1)
        );
        assert_eq!(
            Schedule::from_interval(Duration::from_millis(1)).expression(),
            "* * * * *"
        );
    }

    #[test]
    fn intervals_round_down() {
        assert_eq!(
            Schedule::from_interval(Duration::from_secs(90)),
            Schedule::EveryMinutes(1)
        );
        assert_eq!(
            Schedule::from_interval(Duration::from_secs(5 * 60)).expression(),
            "*/5 * * * *"
        );
        assert_eq!(
            Schedule::from_interval(Duration::from_secs(59 * 60 + 59)),
            Schedule::EveryMinutes(59)
        );
        assert_eq!(
            Schedule::from_interval(Duration::from_secs(90 * 60)).expression(),
            "0 * * * *"
        );
        assert_eq!(
            Schedule::from_interval(Duration::from_secs(3 * 3600)).expression(),
            "0 */3 * * *"
        );
        assert_eq!(
            Schedule::from_interval(Duration::from_secs(36 * 3600)),
            Schedule::EveryDays(1)
        );
        assert_eq!(
            Schedule::EveryDays(2).period(),
            Duration::from_secs(2 * 86_400)
        );
    }

    #[tokio::test]
    async fn run_now_skips_overlapping_run() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule(
                "slow",
                Duration::from_secs(60),
                counting_task(counter.clone(), Duration::from_millis(150)),
            )
            .await;

        let (a, b) = tokio::join!(scheduler.run_now("slow"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            scheduler.run_now("slow").await
        });

        assert_eq!(a.unwrap(), RunOutcome::Completed);
        assert_eq!(b.unwrap(), RunOutcome::Skipped);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let status = &scheduler.jobs().await[0];
        assert_eq!(status.runs, 1);
        assert_eq!(status.skips, 1);
        assert!(!status.running);

        // Guard released: a later run goes through.
        assert_eq!(
            scheduler.run_now("slow").await.unwrap(),
            RunOutcome::Completed
        );
    }

    #[tokio::test]
    async fn run_all_runs_every_job() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c"] {
            scheduler
                .schedule(
                    name,
                    Duration::from_secs(60),
                    counting_task(counter.clone(), Duration::ZERO),
                )
                .await;
        }

        let outcomes = scheduler.run_all().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|(_, o)| *o == RunOutcome::Completed));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let scheduler = Scheduler::new();
        assert!(scheduler.run_now("nope").await.is_err());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule(
                "tick",
                Duration::from_secs(60),
                counting_task(counter.clone(), Duration::ZERO),
            )
            .await;

        scheduler.start().await;
        scheduler.start().await;
        assert!(scheduler.is_started());

        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_started());
        // The first tick is a full period away, so nothing ran.
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
