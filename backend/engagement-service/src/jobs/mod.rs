//! Background job scheduler
//!
//! Every engine runs in its own task on its own period:
//! - interest decay + clustering
//! - video metrics
//! - post attractiveness
//! - follow suggestions
//! - relationship maintenance
//!
//! A run that errors or panics is recorded as an ERROR run and the loop keeps
//! ticking. Consecutive failures add a bounded backoff before the next tick.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

pub mod engine_jobs;
pub mod health;

pub use engine_jobs::{
    AttractivenessJob, InterestMaintenanceJob, RelationshipMaintenanceJob, SuggestionJob,
    VideoMetricsJob,
};
pub use health::HealthMonitor;

use crate::clock::Clock;
use crate::error::Result;
use crate::metrics;
use crate::models::{JobRunRecord, PerformanceMetrics, Subsystem};
use crate::services::BatchReport;

/// A batch pass of one engine, run on a fixed period
#[async_trait]
pub trait EngineJob: Send + Sync {
    fn subsystem(&self) -> Subsystem;

    fn interval(&self) -> Duration;

    async fn run(&self) -> Result<BatchReport>;

    /// Job name used in logs and metrics
    fn name(&self) -> &'static str {
        self.subsystem().as_str()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", s)
    } else {
        "job panicked".to_string()
    }
}

/// Run a job once, record the run and update the failure counter
pub async fn run_once(
    job: &dyn EngineJob,
    monitor: &HealthMonitor,
    clock: &dyn Clock,
    consecutive_failures: &mut u32,
) -> PerformanceMetrics {
    let job_name = job.name();
    let started_at = clock.now();
    let timer = Instant::now();

    let (report, run_error, failure_label) = match AssertUnwindSafe(job.run()).catch_unwind().await
    {
        Ok(Ok(report)) => (report, None, None),
        Ok(Err(e)) => (BatchReport::default(), Some(e.to_string()), Some("failed")),
        Err(payload) => (
            BatchReport::default(),
            Some(panic_message(payload.as_ref())),
            Some("panicked"),
        ),
    };
    let duration_ms = timer.elapsed().as_millis() as u64;

    let record = JobRunRecord {
        subsystem: job.subsystem(),
        started_at,
        finished_at: clock.now(),
        duration_ms: duration_ms as i64,
        items_processed: report.total() as i64,
        items_failed: report.failed as i64,
        error: run_error,
    };
    let snapshot = monitor.record_run(&record).await;

    match (failure_label, &record.error) {
        (Some(label), Some(e)) => {
            *consecutive_failures += 1;
            error!(
                job_name = job_name,
                error = %e,
                consecutive_failures = *consecutive_failures,
                "Job execution failed, will retry on next interval"
            );
            metrics::record_job_failure(job_name, label, duration_ms, *consecutive_failures);
        }
        _ => {
            if *consecutive_failures > 0 {
                info!(
                    job_name = job_name,
                    recovered_after = *consecutive_failures,
                    "Job recovered after failures"
                );
                *consecutive_failures = 0;
            }
            info!(
                job_name = job_name,
                succeeded = report.succeeded,
                failed = report.failed,
                duration_ms,
                status = snapshot.status.as_str(),
                "Job run completed"
            );
            metrics::record_job_success(
                job_name,
                duration_ms,
                report.succeeded,
                report.failed,
                snapshot.success_rate,
                snapshot.status,
            );
        }
    }

    snapshot
}

/// Backoff before the next tick after repeated failures
fn failure_backoff(consecutive_failures: u32) -> Option<Duration> {
    if consecutive_failures >= 3 {
        Some(Duration::from_secs(2u64.pow(consecutive_failures.min(5))))
    } else {
        None
    }
}

async fn run_job_loop(
    job: Arc<dyn EngineJob>,
    monitor: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
    run_on_start: bool,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = job.interval();
    let first_tick = if run_on_start {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval_timer = interval_at(first_tick, period);
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    info!(
        job_name = job.name(),
        interval_sec = period.as_secs(),
        "Starting job loop"
    );

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                run_once(job.as_ref(), &monitor, clock.as_ref(), &mut consecutive_failures).await;

                if let Some(backoff) = failure_backoff(consecutive_failures) {
                    info!(
                        job_name = job.name(),
                        backoff_secs = backoff.as_secs(),
                        "Applying exponential backoff due to consecutive failures"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
            _ = shutdown.recv() => {
                info!(job_name = job.name(), "Received shutdown signal, stopping job loop");
                break;
            }
        }
    }

    info!(job_name = job.name(), "Job loop stopped");
}

/// Set of jobs to start together
pub struct Scheduler {
    jobs: Vec<Arc<dyn EngineJob>>,
    monitor: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
    run_on_start: bool,
}

impl Scheduler {
    pub fn new(monitor: Arc<HealthMonitor>, clock: Arc<dyn Clock>, run_on_start: bool) -> Self {
        Self {
            jobs: Vec::new(),
            monitor,
            clock,
            run_on_start,
        }
    }

    pub fn with_job(mut self, job: Arc<dyn EngineJob>) -> Self {
        self.jobs.push(job);
        self
    }

    /// Spawn one task per job
    pub fn start(self) -> SchedulerHandle {
        let (shutdown, _) = broadcast::channel(1);
        let handles = self
            .jobs
            .into_iter()
            .map(|job| {
                tokio::spawn(run_job_loop(
                    job,
                    self.monitor.clone(),
                    self.clock.clone(),
                    self.run_on_start,
                    shutdown.subscribe(),
                ))
            })
            .collect::<Vec<_>>();

        info!(jobs = handles.len(), "Scheduler started");
        SchedulerHandle { shutdown, handles }
    }
}

/// Owns the running job tasks
pub struct SchedulerHandle {
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn job_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop scheduling new cycles and wait for in-flight runs to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Job task panicked");
            }
        }
        info!("Scheduler stopped");
    }
}
