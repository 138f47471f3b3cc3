//! Health classification of job runs
//!
//! success_rate > healthy threshold  -> HEALTHY
//! success_rate > warning threshold  -> WARNING
//! otherwise, or the run failed      -> ERROR

use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::HealthConfig;
use crate::error::Result;
use crate::models::{HealthStatus, JobRunRecord, PerformanceMetrics, Subsystem};
use crate::notifier::{AlertSink, HealthAlert};
use crate::repository::RunRecordStore;

pub fn classify(success_rate: f64, config: &HealthConfig) -> HealthStatus {
    if success_rate > config.healthy_success_rate {
        HealthStatus::Healthy
    } else if success_rate > config.warning_success_rate {
        HealthStatus::Warning
    } else {
        HealthStatus::Error
    }
}

/// Snapshot of one run
pub fn performance_metrics(record: &JobRunRecord, config: &HealthConfig) -> PerformanceMetrics {
    let (success_rate, error_count) = if record.error.is_some() {
        (0.0, record.items_failed.max(1))
    } else if record.items_processed == 0 {
        (1.0, 0)
    } else {
        let succeeded = (record.items_processed - record.items_failed).max(0);
        (
            succeeded as f64 / record.items_processed as f64,
            record.items_failed,
        )
    };
    let status = if record.error.is_some() {
        HealthStatus::Error
    } else {
        classify(success_rate, config)
    };
    PerformanceMetrics {
        subsystem: record.subsystem,
        execution_time_ms: record.duration_ms,
        success_rate,
        error_count,
        status,
        last_run_at: Some(record.finished_at),
    }
}

pub struct HealthMonitor {
    runs: Arc<dyn RunRecordStore>,
    alerts: Arc<dyn AlertSink>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        runs: Arc<dyn RunRecordStore>,
        alerts: Arc<dyn AlertSink>,
        config: HealthConfig,
    ) -> Self {
        Self {
            runs,
            alerts,
            config,
        }
    }

    /// Persist a run record and alert on a degraded outcome.
    ///
    /// Neither a failed insert nor a failed alert is propagated; the
    /// scheduler must keep ticking when the store is down.
    pub async fn record_run(&self, record: &JobRunRecord) -> PerformanceMetrics {
        let metrics = performance_metrics(record, &self.config);

        if let Err(e) = self.runs.insert_run(record).await {
            warn!(
                subsystem = %record.subsystem,
                error = %e,
                "Failed to persist job run record"
            );
        }

        if metrics.status != HealthStatus::Healthy {
            let alert = HealthAlert {
                metrics: metrics.clone(),
                error: record.error.clone(),
            };
            if let Err(e) = self.alerts.send_alert(&alert).await {
                warn!(
                    subsystem = %record.subsystem,
                    error = %e,
                    "Failed to deliver health alert"
                );
            }
        }

        metrics
    }

    /// Latest snapshot per subsystem. Subsystems that never ran report
    /// HEALTHY with no `last_run_at`.
    pub async fn run_health_check(&self) -> Result<Vec<PerformanceMetrics>> {
        let latest: HashMap<Subsystem, JobRunRecord> = self
            .runs
            .latest_runs()
            .await?
            .into_iter()
            .map(|record| (record.subsystem, record))
            .collect();

        Ok(Subsystem::ALL
            .iter()
            .map(|subsystem| match latest.get(subsystem) {
                Some(record) => performance_metrics(record, &self.config),
                None => PerformanceMetrics {
                    subsystem: *subsystem,
                    execution_time_ms: 0,
                    success_rate: 1.0,
                    error_count: 0,
                    status: HealthStatus::Healthy,
                    last_run_at: None,
                },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngagementError;
    use crate::repository::MemoryStore;
    use chrono::{TimeZone, Utc};
    use mockall::mock;

    mock! {
        pub Sink {}

        #[async_trait::async_trait]
        impl AlertSink for Sink {
            async fn send_alert(&self, alert: &HealthAlert) -> Result<()>;
        }
    }

    fn record(subsystem: Subsystem, processed: i64, failed: i64, error: Option<&str>) -> JobRunRecord {
        let at = Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap();
        JobRunRecord {
            subsystem,
            started_at: at,
            finished_at: at,
            duration_ms: 40,
            items_processed: processed,
            items_failed: failed,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_thresholds_are_strict() {
        let config = HealthConfig::default();
        assert_eq!(classify(0.95, &config), HealthStatus::Healthy);
        assert_eq!(classify(0.9, &config), HealthStatus::Warning);
        assert_eq!(classify(0.71, &config), HealthStatus::Warning);
        assert_eq!(classify(0.7, &config), HealthStatus::Error);
    }

    #[test]
    fn test_failed_run_is_error_with_zero_success() {
        let m = performance_metrics(
            &record(Subsystem::VideoMetrics, 0, 0, Some("store unavailable")),
            &HealthConfig::default(),
        );
        assert_eq!(m.status, HealthStatus::Error);
        assert_eq!(m.success_rate, 0.0);
        assert_eq!(m.error_count, 1);
    }

    #[test]
    fn test_empty_run_is_healthy() {
        let m = performance_metrics(
            &record(Subsystem::FollowSuggestions, 0, 0, None),
            &HealthConfig::default(),
        );
        assert_eq!(m.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_alerts_only_for_degraded_runs() {
        let mut sink = MockSink::new();
        sink.expect_send_alert()
            .withf(|alert| alert.metrics.status == HealthStatus::Warning)
            .times(1)
            .returning(|_| Ok(()));
        let store = Arc::new(MemoryStore::new());
        let monitor = HealthMonitor::new(store, Arc::new(sink), HealthConfig::default());

        let healthy = monitor
            .record_run(&record(Subsystem::InterestDecay, 100, 2, None))
            .await;
        assert_eq!(healthy.status, HealthStatus::Healthy);
        let warning = monitor
            .record_run(&record(Subsystem::PostAttractiveness, 10, 2, None))
            .await;
        assert_eq!(warning.status, HealthStatus::Warning);
    }

    #[tokio::test]
    async fn test_alert_failure_is_swallowed() {
        let mut sink = MockSink::new();
        sink.expect_send_alert()
            .times(1)
            .returning(|_| Err(EngagementError::store("webhook down")));
        let store = Arc::new(MemoryStore::new());
        let monitor = HealthMonitor::new(store.clone(), Arc::new(sink), HealthConfig::default());

        let m = monitor
            .record_run(&record(Subsystem::VideoMetrics, 0, 0, Some("boom")))
            .await;
        assert_eq!(m.status, HealthStatus::Error);

        let report = monitor.run_health_check().await.unwrap();
        assert_eq!(report.len(), Subsystem::ALL.len());
        let video = report
            .iter()
            .find(|m| m.subsystem == Subsystem::VideoMetrics)
            .unwrap();
        assert_eq!(video.status, HealthStatus::Error);
        let decay = report
            .iter()
            .find(|m| m.subsystem == Subsystem::InterestDecay)
            .unwrap();
        assert!(decay.last_run_at.is_none());
    }
}
