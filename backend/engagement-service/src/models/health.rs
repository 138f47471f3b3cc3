use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngagementError;

/// Background subsystems watched by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    InterestDecay,
    VideoMetrics,
    PostAttractiveness,
    FollowSuggestions,
    RelationshipMaintenance,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::InterestDecay,
        Subsystem::VideoMetrics,
        Subsystem::PostAttractiveness,
        Subsystem::FollowSuggestions,
        Subsystem::RelationshipMaintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::InterestDecay => "interest_decay",
            Subsystem::VideoMetrics => "video_metrics",
            Subsystem::PostAttractiveness => "post_attractiveness",
            Subsystem::FollowSuggestions => "follow_suggestions",
            Subsystem::RelationshipMaintenance => "relationship_maintenance",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subsystem {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Subsystem::ALL
            .into_iter()
            .find(|subsystem| subsystem.as_str() == s)
            .ok_or_else(|| EngagementError::validation(format!("unknown subsystem: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Error => "ERROR",
        }
    }
}

/// Outcome of one batch job run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunRecord {
    pub subsystem: Subsystem,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub items_processed: i64,
    pub items_failed: i64,
    /// Set when the run as a whole failed (e.g. store unavailable)
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub subsystem: Subsystem,
    pub execution_time_ms: i64,
    /// 0.0 ..= 1.0
    pub success_rate: f64,
    pub error_count: i64,
    pub status: HealthStatus,
    pub last_run_at: Option<DateTime<Utc>>,
}
