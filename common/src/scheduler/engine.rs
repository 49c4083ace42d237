// Scheduler engine: one cancellable timer task per repository
//
// The entry table is guarded by a single lock. Installing, replacing and
// cancelling an entry happen inside it, and every tick re-checks its entry's
// token inside it before launching a run, so a cancelled entry can never fire.

use crate::errors::ScheduleError;
use crate::models::{BackupRepository, TriggerSource};
use crate::pipeline::BackupRunner;
use crate::schedule::ScheduleSpec;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Scheduler operations used by bootstrap and management code
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Start firing installed entries. Returns immediately.
    async fn start(&self) -> Result<(), ScheduleError>;

    /// Stop every timer and wait for them to exit. In-flight runs are not awaited.
    async fn stop(&self) -> Result<(), ScheduleError>;

    /// Install or replace the entry for `repository.name`.
    /// Returns whether a periodic entry is now installed.
    fn schedule_backup(&self, repository: &BackupRepository) -> Result<bool, ScheduleError>;

    /// Cancel and remove the entry for `repository.name`, if any
    fn unschedule_backup(&self, repository: &BackupRepository) -> bool;

    /// Replace the entry for `repository.name` with its current schedule
    fn reschedule_backup(&self, repository: &BackupRepository) -> Result<bool, ScheduleError>;
}

struct ScheduleEntry {
    spec: ScheduleSpec,
    token: CancellationToken,
    /// `None` until the scheduler is started
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct SchedulerState {
    entries: HashMap<String, ScheduleEntry>,
    started: bool,
    stopped: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    runner: Arc<dyn BackupRunner>,
    shutdown: CancellationToken,
    timezone: Tz,
}

/// In-process backup scheduler
#[derive(Clone)]
pub struct BackupScheduler {
    shared: Arc<Shared>,
}

impl BackupScheduler {
    /// Create a scheduler evaluating cron expressions in `timezone`
    pub fn new(runner: Arc<dyn BackupRunner>, timezone: Tz) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState::default()),
                runner,
                shutdown: CancellationToken::new(),
                timezone,
            }),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.shared.timezone
    }

    pub fn is_scheduled(&self, repository: &str) -> bool {
        self.shared.state.lock().entries.contains_key(repository)
    }

    pub fn entry_count(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Human-readable schedule of an installed entry
    pub fn describe(&self, repository: &str) -> Option<String> {
        self.shared
            .state
            .lock()
            .entries
            .get(repository)
            .map(|entry| entry.spec.to_string())
    }

    /// Install or replace an entry. The old entry is cancelled in the same
    /// critical section, so at most one entry per name is ever live.
    fn install(&self, name: &str, raw_schedule: &str) -> Result<bool, ScheduleError> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(ScheduleError::SchedulerStopped);
        }

        if let Some(previous) = state.entries.remove(name) {
            previous.token.cancel();
            debug!(repository = %name, "Previous schedule entry cancelled");
        }

        let result = match ScheduleSpec::parse(raw_schedule, self.shared.timezone) {
            Ok(Some(spec)) => {
                let token = self.shared.shutdown.child_token();
                let timer = state
                    .started
                    .then(|| spawn_timer(&self.shared, name, spec.clone(), token.clone()));

                info!(repository = %name, schedule = %spec, "Backup scheduled");
                state.entries.insert(
                    name.to_string(),
                    ScheduleEntry { spec, token, timer },
                );
                Ok(true)
            }
            Ok(None) => {
                info!(repository = %name, "No schedule configured, repository is event-driven only");
                Ok(false)
            }
            Err(e) => {
                error!(repository = %name, schedule = %raw_schedule, error = %e, "Invalid schedule, no timer installed");
                Err(e)
            }
        };

        telemetry::update_scheduled_repositories(state.entries.len());
        result
    }

    fn remove(&self, name: &str) -> bool {
        let mut state = self.shared.state.lock();
        let removed = match state.entries.remove(name) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        };
        telemetry::update_scheduled_repositories(state.entries.len());
        removed
    }
}

#[async_trait]
impl Scheduler for BackupScheduler {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), ScheduleError> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(ScheduleError::SchedulerStopped);
        }
        if state.started {
            warn!("Scheduler already started");
            return Ok(());
        }
        state.started = true;

        for (name, entry) in state.entries.iter_mut() {
            entry.timer = Some(spawn_timer(
                &self.shared,
                name,
                entry.spec.clone(),
                entry.token.clone(),
            ));
        }

        info!(
            entries = state.entries.len(),
            timezone = %self.shared.timezone,
            "Scheduler started"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), ScheduleError> {
        let timers: Vec<JoinHandle<()>> = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
            self.shared.shutdown.cancel();
            state
                .entries
                .drain()
                .filter_map(|(_, entry)| entry.timer)
                .collect()
        };
        telemetry::update_scheduled_repositories(0);

        info!(timers = timers.len(), "Stopping scheduler");
        for timer in timers {
            if let Err(e) = timer.await {
                if e.is_panic() {
                    error!(error = %e, "Timer task panicked");
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    fn schedule_backup(&self, repository: &BackupRepository) -> Result<bool, ScheduleError> {
        self.install(&repository.name, &repository.schedule)
    }

    fn unschedule_backup(&self, repository: &BackupRepository) -> bool {
        let removed = self.remove(&repository.name);
        if removed {
            info!(repository = %repository.name, "Backup unscheduled");
        }
        removed
    }

    fn reschedule_backup(&self, repository: &BackupRepository) -> Result<bool, ScheduleError> {
        debug!(repository = %repository.name, "Rescheduling backup");
        self.install(&repository.name, &repository.schedule)
    }
}

fn spawn_timer(
    shared: &Arc<Shared>,
    name: &str,
    spec: ScheduleSpec,
    token: CancellationToken,
) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    let name = name.to_string();

    tokio::spawn(async move {
        match spec {
            ScheduleSpec::Interval(period) => run_interval(&shared, &name, period, &token).await,
            ScheduleSpec::Cron { .. } => run_cron(&shared, &name, &spec, &token).await,
        }
        debug!(repository = %name, "Timer exited");
    })
}

async fn run_interval(shared: &Shared, name: &str, period: Duration, token: &CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if !fire(shared, name, token) {
                    return;
                }
            }
        }
    }
}

async fn run_cron(shared: &Shared, name: &str, spec: &ScheduleSpec, token: &CancellationToken) {
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        let reference = match last_fired {
            Some(last) => last.max(Utc::now()),
            None => Utc::now(),
        };
        let next = match spec.next_fire_after(reference) {
            Ok(next) => next,
            Err(e) => {
                warn!(repository = %name, error = %e, "Cron schedule exhausted");
                return;
            }
        };
        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {
                last_fired = Some(next);
                if !fire(shared, name, token) {
                    return;
                }
            }
        }
    }
}

/// Launch one detached run unless the entry was cancelled. Returns false when
/// the timer should exit.
fn fire(shared: &Shared, name: &str, token: &CancellationToken) -> bool {
    let _state = shared.state.lock();
    if token.is_cancelled() {
        return false;
    }

    debug!(repository = %name, "Schedule tick");
    tokio::spawn(run_detached(Arc::clone(&shared.runner), name.to_string()));
    true
}

/// A tick's run is never awaited by its timer. Errors and panics stop here.
async fn run_detached(runner: Arc<dyn BackupRunner>, name: String) {
    let run = AssertUnwindSafe(runner.run_backup(&name, TriggerSource::Scheduled)).catch_unwind();
    match run.await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!(repository = %name, error = %e, "Scheduled backup failed"),
        Err(_) => error!(repository = %name, "Scheduled backup panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;
    use crate::git::PullOutcome;
    use crate::pipeline::BackupReport;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every run with the paused-clock instant it started at
    struct RecordingRunner {
        origin: Instant,
        calls: tokio::sync::Mutex<Vec<(String, Duration)>>,
        completed: AtomicUsize,
        run_time: Duration,
        panic_on_first: bool,
    }

    impl RecordingRunner {
        fn new() -> Arc<Self> {
            Self::with(Duration::ZERO, false)
        }

        fn with(run_time: Duration, panic_on_first: bool) -> Arc<Self> {
            Arc::new(Self {
                origin: Instant::now(),
                calls: tokio::sync::Mutex::new(Vec::new()),
                completed: AtomicUsize::new(0),
                run_time,
                panic_on_first,
            })
        }

        async fn calls_for(&self, name: &str) -> Vec<u64> {
            self.calls
                .lock()
                .await
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, at)| at.as_secs())
                .collect()
        }
    }

    #[async_trait]
    impl BackupRunner for RecordingRunner {
        async fn run_backup(
            &self,
            repository: &str,
            _trigger: TriggerSource,
        ) -> Result<BackupReport, PipelineError> {
            let first = {
                let mut calls = self.calls.lock().await;
                calls.push((repository.to_string(), self.origin.elapsed()));
                calls.len() == 1
            };
            if self.panic_on_first && first {
                panic!("runner blew up");
            }
            if !self.run_time.is_zero() {
                tokio::time::sleep(self.run_time).await;
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(BackupReport {
                repository: repository.to_string(),
                pull: PullOutcome::UpToDate,
                uploads: Vec::new(),
                duration: self.run_time,
            })
        }
    }

    fn repo(name: &str, schedule: &str) -> BackupRepository {
        BackupRepository::new(name, "https://example.com/r.git", Path::new("/data"))
            .unwrap()
            .with_schedule(schedule)
    }

    async fn started(runner: Arc<RecordingRunner>) -> BackupScheduler {
        let scheduler = BackupScheduler::new(runner, Tz::UTC);
        scheduler.start().await.unwrap();
        scheduler
    }

    async fn advance_to(runner: &RecordingRunner, secs: u64) {
        let target = runner.origin + Duration::from_secs(secs);
        tokio::time::sleep_until(target).await;
        // Let detached runs spawned at this instant record themselves
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_fires_every_period() {
        let runner = RecordingRunner::new();
        let scheduler = started(runner.clone()).await;
        assert!(scheduler.schedule_backup(&repo("demo", "5")).unwrap());

        advance_to(&runner, 299).await;
        assert!(runner.calls_for("demo").await.is_empty());

        advance_to(&runner, 601).await;
        assert_eq!(runner.calls_for("demo").await, vec![300, 600]);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_before_first_tick_moves_it() {
        let runner = RecordingRunner::new();
        let scheduler = started(runner.clone()).await;
        scheduler.schedule_backup(&repo("demo", "5")).unwrap();
        scheduler.reschedule_backup(&repo("demo", "10")).unwrap();

        advance_to(&runner, 599).await;
        assert!(runner.calls_for("demo").await.is_empty());

        advance_to(&runner, 601).await;
        assert_eq!(runner.calls_for("demo").await, vec![600]);
        assert_eq!(scheduler.describe("demo").unwrap(), "every 10 minute(s)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_latest_schedule_fires() {
        let runner = RecordingRunner::new();
        let scheduler = started(runner.clone()).await;
        for minutes in ["1", "2", "3", "7"] {
            scheduler.schedule_backup(&repo("demo", minutes)).unwrap();
            assert_eq!(scheduler.entry_count(), 1);
        }

        advance_to(&runner, 7 * 60 + 1).await;
        assert_eq!(runner.calls_for("demo").await, vec![420]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_schedule_calls_leave_one_entry() {
        let runner = RecordingRunner::new();
        let scheduler = started(runner.clone()).await;

        let tasks: Vec<_> = (1..=8)
            .map(|minutes| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    scheduler
                        .schedule_backup(&repo("demo", &minutes.to_string()))
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(scheduler.entry_count(), 1);

        advance_to(&runner, 8 * 60 + 1).await;
        // Exactly one surviving timer: never more than one run per minute mark
        let calls = runner.calls_for("demo").await;
        let mut deduped = calls.clone();
        deduped.dedup();
        assert_eq!(calls, deduped);
        assert!(!calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedule_stops_future_ticks() {
        let runner = RecordingRunner::new();
        let scheduler = started(runner.clone()).await;
        let demo = repo("demo", "5");
        scheduler.schedule_backup(&demo).unwrap();

        advance_to(&runner, 301).await;
        assert!(scheduler.unschedule_backup(&demo));
        assert!(!scheduler.unschedule_backup(&demo));
        assert!(!scheduler.is_scheduled("demo"));

        advance_to(&runner, 3600).await;
        assert_eq!(runner.calls_for("demo").await, vec![300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_run_survives_reschedule() {
        let runner = RecordingRunner::with(Duration::from_secs(120), false);
        let scheduler = started(runner.clone()).await;
        scheduler.schedule_backup(&repo("demo", "5")).unwrap();

        advance_to(&runner, 301).await;
        scheduler.reschedule_backup(&repo("demo", "10")).unwrap();
        assert_eq!(runner.completed.load(Ordering::SeqCst), 0);

        advance_to(&runner, 430).await;
        assert_eq!(runner.completed.load(Ordering::SeqCst), 1);

        // New entry installed at t=301 first fires ten minutes later
        advance_to(&runner, 902).await;
        assert_eq!(runner.calls_for("demo").await, vec![300, 901]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_cron_installs_nothing() {
        let runner = RecordingRunner::new();
        let scheduler = started(runner.clone()).await;
        scheduler.schedule_backup(&repo("demo", "5")).unwrap();

        let err = scheduler
            .schedule_backup(&repo("demo", "invalid cron"))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCronExpression { .. }));
        assert!(!scheduler.is_scheduled("demo"));

        advance_to(&runner, 3600).await;
        assert!(runner.calls_for("demo").await.is_empty());

        // Other repositories are unaffected
        assert!(scheduler.schedule_backup(&repo("other", "1")).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_schedule_is_event_driven() {
        let runner = RecordingRunner::new();
        let scheduler = started(runner.clone()).await;
        assert!(!scheduler.schedule_backup(&repo("demo", "")).unwrap());
        assert_eq!(scheduler.entry_count(), 0);
        assert!(matches!(
            scheduler.schedule_backup(&repo("demo", "0")),
            Err(ScheduleError::InvalidInterval(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_wait_for_start() {
        let runner = RecordingRunner::new();
        let scheduler = BackupScheduler::new(runner.clone(), Tz::UTC);
        scheduler.schedule_backup(&repo("demo", "1")).unwrap();

        advance_to(&runner, 300).await;
        assert!(runner.calls_for("demo").await.is_empty());

        scheduler.start().await.unwrap();
        advance_to(&runner, 361).await;
        assert_eq!(runner.calls_for("demo").await, vec![360]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_all_timers() {
        let runner = RecordingRunner::new();
        let scheduler = started(runner.clone()).await;
        scheduler.schedule_backup(&repo("a", "1")).unwrap();
        scheduler.schedule_backup(&repo("b", "2")).unwrap();

        advance_to(&runner, 61).await;
        scheduler.stop().await.unwrap();
        assert_eq!(scheduler.entry_count(), 0);

        advance_to(&runner, 3600).await;
        assert_eq!(runner.calls_for("a").await, vec![60]);
        assert!(runner.calls_for("b").await.is_empty());
        assert_eq!(
            scheduler.schedule_backup(&repo("a", "1")).unwrap_err(),
            ScheduleError::SchedulerStopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_run_does_not_stop_the_timer() {
        let runner = RecordingRunner::with(Duration::ZERO, true);
        let scheduler = started(runner.clone()).await;
        scheduler.schedule_backup(&repo("demo", "1")).unwrap();

        advance_to(&runner, 181).await;
        assert_eq!(runner.calls_for("demo").await, vec![60, 120, 180]);
        assert_eq!(runner.completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cron_entry_is_installed() {
        let runner = RecordingRunner::new();
        let scheduler = started(runner.clone()).await;
        assert!(scheduler.schedule_backup(&repo("demo", "*/5 * * * *")).unwrap());
        assert_eq!(
            scheduler.describe("demo").unwrap(),
            "cron '0 */5 * * * *' (UTC)"
        );
        scheduler.stop().await.unwrap();
    }

    // Cron timers follow the wall clock, so this runs in real time
    #[tokio::test]
    async fn test_cron_fires_each_occurrence_until_unscheduled() {
        let runner = RecordingRunner::new();
        let scheduler = started(runner.clone()).await;
        let demo = repo("demo", "* * * * * *");
        assert!(scheduler.schedule_backup(&demo).unwrap());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let fired: Vec<Duration> = runner
            .calls
            .lock()
            .await
            .iter()
            .map(|(_, at)| *at)
            .collect();
        assert!((2..=4).contains(&fired.len()), "fired {} times", fired.len());
        // One run per occurrence, never two for the same second
        for pair in fired.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }

        assert!(scheduler.unschedule_backup(&demo));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_unschedule = runner.calls.lock().await.len();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(runner.calls.lock().await.len(), after_unschedule);
        scheduler.stop().await.unwrap();
    }
}
