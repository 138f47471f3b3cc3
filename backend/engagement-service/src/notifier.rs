//! Outbound health alerts

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::Result;
use crate::models::{HealthStatus, PerformanceMetrics};

/// One WARNING or ERROR subsystem snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub metrics: PerformanceMetrics,
    /// Failure of the run as a whole, if any
    pub error: Option<String>,
}

/// Notification collaborator receiving degraded-health alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, alert: &HealthAlert) -> Result<()>;
}

/// Sink that only writes alerts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send_alert(&self, alert: &HealthAlert) -> Result<()> {
        let m = &alert.metrics;
        match m.status {
            HealthStatus::Error => error!(
                subsystem = %m.subsystem,
                success_rate = m.success_rate,
                error_count = m.error_count,
                execution_time_ms = m.execution_time_ms,
                run_error = alert.error.as_deref().unwrap_or(""),
                payload = %serde_json::to_string(alert).unwrap_or_default(),
                "Subsystem unhealthy"
            ),
            _ => warn!(
                subsystem = %m.subsystem,
                success_rate = m.success_rate,
                error_count = m.error_count,
                execution_time_ms = m.execution_time_ms,
                "Subsystem degraded"
            ),
        }
        Ok(())
    }
}
