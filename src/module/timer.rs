//! Built-in timer module, auto-registered by the application shell before any
//! user module (§4.6 step 6).
//!
//! Grounded in `timer/timer.go`'s tick-driven cronjob map: a single ticker
//! fires on a fixed interval, and on each tick every job whose own interval
//! has elapsed since its last run gets dispatched onto its own task (the
//! original's `go func` per firing), panic-guarded the same way
//! `rpc::server::RpcServer::dispatch` guards a handler call. A job's handler
//! returns whether it should keep recurring; `false` deletes it, matching
//! `TTimerHandFunc`'s `bool` return driving `DelTimerByName` in the original.
//!
//! The original module wraps a single global `timewheel` instance reachable
//! from anywhere in the process. This crate has already rejected that
//! ambient-global shape for discovery (see `module::handle::AppHandle`'s doc
//! comment), so [`TimerModule`] keeps its [`TimerService`] private rather
//! than exposing a second global singleton; it is a self-contained background
//! service, not a scheduling facility other modules register into.

use crate::error::Result;
use crate::module::{Module, ModuleInitContext};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// `true` to keep recurring, `false` to self-delete after this firing.
pub type TimerHandler = Arc<
    dyn Fn(Instant) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync,
>;

struct CronJob {
    handler: TimerHandler,
    interval: Duration,
    daily: bool,
    last: Instant,
    last_day: Option<chrono::NaiveDate>,
}

/// Default tick interval driving the job map, matching the original's
/// `C_TIMER_TICK_INTERVAL` fixed-cadence ticker.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A private, tick-driven scheduler: jobs keyed by name, checked against
/// their own interval on every tick rather than each getting its own sleep.
pub struct TimerService {
    jobs: DashMap<String, CronJob>,
    tick_interval: Duration,
}

impl TimerService {
    pub fn new() -> Arc<Self> {
        Self::with_tick_interval(DEFAULT_TICK_INTERVAL)
    }

    pub fn with_tick_interval(tick_interval: Duration) -> Arc<Self> {
        Arc::new(Self { jobs: DashMap::new(), tick_interval })
    }

    /// Register a recurring job: `handler` fires once `interval` has elapsed
    /// since its last firing (checked at tick granularity, not to-the-second).
    pub fn add_timer(&self, name: impl Into<String>, interval: Duration, handler: TimerHandler) {
        self.jobs.insert(
            name.into(),
            CronJob { handler, interval, daily: false, last: Instant::now(), last_day: None },
        );
    }

    /// Register a job that fires at most once per calendar day, matching the
    /// original's "daily" cronjob: its own `interval` doesn't gate it, only
    /// whether it has already fired since local midnight. Due-ness is judged
    /// against `chrono::Local`'s current date rather than `interval`, so the
    /// job fires once per day regardless of the tick cadence.
    pub fn add_daily_timer(&self, name: impl Into<String>, handler: TimerHandler) {
        self.jobs.insert(
            name.into(),
            CronJob { handler, interval: Duration::from_secs(0), daily: true, last: Instant::now(), last_day: None },
        );
    }

    pub fn del_timer(&self, name: &str) {
        self.jobs.remove(name);
    }

    /// Drive the tick loop until `close_signal` fires.
    pub async fn run(&self, mut close_signal: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = close_signal.changed() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        if self.jobs.is_empty() {
            return;
        }
        let now = Instant::now();
        let today = chrono::Local::now().date_naive();
        let due: Vec<(String, TimerHandler)> = self
            .jobs
            .iter()
            .filter(|entry| {
                if entry.daily {
                    entry.last_day != Some(today)
                } else {
                    now.duration_since(entry.last) >= entry.interval
                }
            })
            .map(|entry| (entry.key().clone(), entry.handler.clone()))
            .collect();

        for (name, handler) in due {
            if let Some(mut job) = self.jobs.get_mut(&name) {
                job.last = now;
                job.last_day = Some(today);
            }
            let name_for_task = name.clone();
            let jobs = self.jobs_handle();
            tokio::spawn(async move {
                let keep = match AssertUnwindSafe(handler(now)).catch_unwind().await {
                    Ok(keep) => keep,
                    Err(_) => {
                        tracing::error!(job = %name_for_task, "timer job panicked");
                        true
                    }
                };
                if !keep {
                    jobs.remove(&name_for_task);
                }
            });
        }
    }

    fn jobs_handle(&self) -> &DashMap<String, CronJob> {
        &self.jobs
    }
}

/// The framework-level module wrapper the application shell registers ahead
/// of every user module, per the original's `TimerModule` constructor
/// (`module/modules/timer_module.go`).
pub struct TimerModule {
    service: Arc<TimerService>,
}

impl TimerModule {
    pub fn new() -> Self {
        Self { service: TimerService::new() }
    }
}

impl Default for TimerModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for TimerModule {
    fn module_type(&self) -> &str {
        "Timer"
    }

    async fn on_init(&self, _ctx: &ModuleInitContext, _handle: Arc<crate::module::AppHandle>) -> Result<()> {
        Ok(())
    }

    async fn run(&self, close_signal: watch::Receiver<bool>) -> Result<()> {
        self.service.run(close_signal).await;
        Ok(())
    }

    async fn on_destroy(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn due_job_fires_and_recurs() {
        let service = TimerService::with_tick_interval(Duration::from_millis(5));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        service.add_timer(
            "counter",
            Duration::from_millis(10),
            Arc::new(move |_| {
                let fired = fired2.clone();
                Box::pin(async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    true
                })
            }),
        );

        let (_tx, rx) = watch::channel(false);
        let run = tokio::spawn({
            let service = service.clone();
            async move { service.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        run.abort();

        assert!(fired.load(Ordering::SeqCst) >= 2, "expected at least two firings, got {}", fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn job_returning_false_is_removed() {
        let service = TimerService::with_tick_interval(Duration::from_millis(5));
        service.add_timer("once", Duration::from_millis(1), Arc::new(|_| Box::pin(async move { false })));

        let (_tx, rx) = watch::channel(false);
        let run = tokio::spawn({
            let service = service.clone();
            async move { service.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        run.abort();

        assert!(service.jobs.is_empty());
    }

    #[tokio::test]
    async fn daily_job_fires_once_not_on_every_tick() {
        let service = TimerService::with_tick_interval(Duration::from_millis(5));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        service.add_daily_timer(
            "midnight-report",
            Arc::new(move |_| {
                let fired = fired2.clone();
                Box::pin(async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    true
                })
            }),
        );

        let (_tx, rx) = watch::channel(false);
        let run = tokio::spawn({
            let service = service.clone();
            async move { service.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        run.abort();

        assert_eq!(fired.load(Ordering::SeqCst), 1, "daily job should fire once across many ticks within the same day");
    }

    #[tokio::test]
    async fn timer_module_reports_its_type() {
        let module = TimerModule::new();
        assert_eq!(module.module_type(), "Timer");
    }
}
