//! Scoring engines
//!
//! Each engine owns one kind of derived state. Engines never call each other;
//! the scheduler and [`crate::engine::EngagementEngine`] are the only places
//! that know all of them.

pub mod attractiveness;
pub mod best_friend;
pub mod follow_suggestions;
pub mod interest_decay;
pub mod video_metrics;

pub use attractiveness::AttractivenessScorer;
pub use best_friend::BestFriendEngine;
pub use follow_suggestions::FollowSuggestionGenerator;
pub use interest_decay::InterestDecayEngine;
pub use video_metrics::VideoMetricsAggregator;

use futures::stream::{self, StreamExt};
use resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use tracing::warn;

use crate::error::{EngagementError, Result};
use crate::models::Subsystem;

/// Outcome of one batch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: u64,
    pub failed: u64,
}

impl BatchReport {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// 1.0 for an empty pass
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 1.0,
            total => self.succeeded as f64 / total as f64,
        }
    }

    pub fn merge(self, other: BatchReport) -> BatchReport {
        BatchReport {
            succeeded: self.succeeded + other.succeeded,
            failed: self.failed + other.failed,
        }
    }
}

/// Run `work` for every item with at most `concurrency` in flight.
///
/// A failing item is logged and counted; it never stops the others.
pub(crate) async fn fan_out<I, F, Fut, T>(
    subsystem: Subsystem,
    items: Vec<I>,
    concurrency: usize,
    work: F,
) -> BatchReport
where
    I: Display + Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let results: Vec<(I, Result<T>)> = stream::iter(items)
        .map(|item| {
            let fut = work(item.clone());
            async move { (item, fut.await) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = BatchReport::default();
    for (item, result) in results {
        match result {
            Ok(_) => report.succeeded += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    subsystem = %subsystem,
                    entity = %item,
                    error = %e,
                    error_kind = e.kind(),
                    "Entity failed during batch pass"
                );
            }
        }
    }
    report
}

/// Retry a single-entity operation on transient store errors and conflicts
pub(crate) async fn with_store_retry<T, F, Fut>(config: &RetryConfig, f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    resilience::with_retry_if(config.clone(), EngagementError::is_retryable, f)
        .await
        .map_err(EngagementError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_empty_report_is_fully_successful() {
        assert_eq!(BatchReport::default().success_rate(), 1.0);
        let report = BatchReport {
            succeeded: 3,
            failed: 1,
        };
        assert_eq!(report.total(), 4);
        assert!((report.success_rate() - 0.75).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_fan_out_counts_failures_without_aborting() {
        let report = fan_out(
            Subsystem::VideoMetrics,
            (1..=10).collect::<Vec<u32>>(),
            3,
            |n| async move {
                if n % 4 == 0 {
                    Err(EngagementError::store(format!("item {}", n)))
                } else {
                    Ok(())
                }
            },
        )
        .await;
        assert_eq!(report.succeeded, 8);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn test_store_retry_gives_up_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(2),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let result: Result<()> = with_store_retry(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngagementError::validation("bad topic")) }
        })
        .await;
        assert!(matches!(result, Err(EngagementError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(2),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let result = with_store_retry(&config, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(EngagementError::store("connection reset"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
    }
}
