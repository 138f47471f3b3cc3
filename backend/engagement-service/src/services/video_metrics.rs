//! Video metrics aggregation
//!
//! Folds the append-only watch sessions of a post into one `VideoMetrics`
//! row. The fold is pure: the same sessions always produce the same values,
//! so overlapping sweeps from several instances are harmless.

use chrono::{DateTime, Duration, Utc};
use resilience::RetryConfig;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{fan_out, with_store_retry, BatchReport};
use crate::clock::Clock;
use crate::config::VideoMetricsConfig;
use crate::error::{EngagementError, Result};
use crate::models::{Subsystem, VideoMetrics, VideoWatchSession};
use crate::repository::VideoStore;

/// Aggregate a post's sessions. Zero sessions yield all-zero metrics.
pub fn aggregate_sessions(
    post_id: Uuid,
    sessions: &[VideoWatchSession],
    now: DateTime<Utc>,
) -> VideoMetrics {
    if sessions.is_empty() {
        return VideoMetrics::empty(post_id, now);
    }

    // fixed summation order keeps the floating point results stable
    let mut ordered: Vec<&VideoWatchSession> = sessions.iter().collect();
    ordered.sort_by(|a, b| {
        a.user_id
            .cmp(&b.user_id)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });

    let unique_viewers = ordered
        .iter()
        .map(|s| s.user_id)
        .collect::<HashSet<_>>()
        .len() as i64;

    VideoMetrics {
        post_id,
        total_views: ordered.len() as i64,
        unique_viewers,
        average_watch_time: mean(&ordered, |s| s.watched_duration),
        completion_rate: mean(&ordered, |s| if s.is_completed { 1.0 } else { 0.0 }),
        retention_rate: mean(&ordered, |s| s.watched_percentage),
        average_pause_count: mean(&ordered, |s| s.pause_count as f64),
        average_seek_count: mean(&ordered, |s| s.seek_count as f64),
        rewatch_rate: mean(&ordered, |s| if s.play_count > 1 { 1.0 } else { 0.0 }),
        average_exit_point: mean(&ordered, |s| s.exit_point),
        updated_at: now,
    }
}

fn mean(sessions: &[&VideoWatchSession], f: impl Fn(&VideoWatchSession) -> f64) -> f64 {
    sessions.iter().map(|s| f(s)).sum::<f64>() / sessions.len() as f64
}

fn validate_session(session: &VideoWatchSession) -> Result<()> {
    if session.user_id.is_nil() || session.post_id.is_nil() {
        return Err(EngagementError::validation("session ids must not be nil"));
    }
    if session.session_id.trim().is_empty() {
        return Err(EngagementError::validation("session_id must not be empty"));
    }
    for (name, value) in [
        ("video_duration", session.video_duration),
        ("watched_duration", session.watched_duration),
        ("exit_point", session.exit_point),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(EngagementError::validation(format!(
                "{} must be a non-negative number, got {}",
                name, value
            )));
        }
    }
    if !(0.0..=100.0).contains(&session.watched_percentage) {
        return Err(EngagementError::validation(format!(
            "watched_percentage must be within 0..=100, got {}",
            session.watched_percentage
        )));
    }
    let counters = [
        session.play_count,
        session.pause_count,
        session.seek_count,
        session.quality_changes,
        session.volume_changes,
    ];
    if counters.iter().any(|c| *c < 0) {
        return Err(EngagementError::validation(
            "session counters must not be negative",
        ));
    }
    Ok(())
}

pub struct VideoMetricsAggregator {
    videos: Arc<dyn VideoStore>,
    clock: Arc<dyn Clock>,
    config: VideoMetricsConfig,
    retry: RetryConfig,
}

impl VideoMetricsAggregator {
    pub fn new(
        videos: Arc<dyn VideoStore>,
        clock: Arc<dyn Clock>,
        config: VideoMetricsConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            videos,
            clock,
            config,
            retry,
        }
    }

    /// Append a watch session. Returns false for a duplicate session.
    pub async fn record_watch_session(&self, session: &VideoWatchSession) -> Result<bool> {
        validate_session(session)?;
        let inserted = with_store_retry(&self.retry, || self.videos.append_session(session)).await?;
        if !inserted {
            debug!(
                post_id = %session.post_id,
                user_id = %session.user_id,
                session_id = %session.session_id,
                "Duplicate watch session ignored"
            );
        }
        Ok(inserted)
    }

    /// Recompute and upsert one post's metrics
    pub async fn recompute_for_post(&self, post_id: Uuid) -> Result<VideoMetrics> {
        let sessions = self.videos.sessions_for_post(post_id).await?;
        let metrics = aggregate_sessions(post_id, &sessions, self.clock.now());
        self.videos.upsert_metrics(&metrics).await?;

        debug!(
            post_id = %post_id,
            total_views = metrics.total_views,
            completion_rate = metrics.completion_rate,
            "Video metrics recomputed"
        );
        Ok(metrics)
    }

    /// Same as [`Self::recompute_for_post`], retried on transient errors
    pub async fn recompute(&self, post_id: Uuid) -> Result<VideoMetrics> {
        with_store_retry(&self.retry, || self.recompute_for_post(post_id)).await
    }

    /// Stored metrics. A post without a stored row is aggregated on the fly
    /// and nothing is written; the sweep owns persistence.
    pub async fn get_metrics(&self, post_id: Uuid) -> Result<VideoMetrics> {
        match with_store_retry(&self.retry, || self.videos.get_metrics(post_id)).await? {
            Some(metrics) => Ok(metrics),
            None => {
                let sessions =
                    with_store_retry(&self.retry, || self.videos.sessions_for_post(post_id))
                        .await?;
                Ok(aggregate_sessions(post_id, &sessions, self.clock.now()))
            }
        }
    }

    /// Recompute posts watched inside the active window
    pub async fn run_metrics_sweep(&self) -> Result<BatchReport> {
        let start = Instant::now();
        let since = self.clock.now() - Duration::hours(self.config.active_window_hours);
        let posts = self
            .videos
            .posts_watched_since(since, self.config.max_posts_per_cycle)
            .await?;
        let post_count = posts.len();

        let report = fan_out(
            Subsystem::VideoMetrics,
            posts,
            self.config.worker_concurrency,
            |post_id| self.recompute_for_post(post_id),
        )
        .await;

        info!(
            posts = post_count,
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Video metrics sweep completed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::repository::MemoryStore;
    use chrono::TimeZone;

    fn session(post_id: Uuid, user_id: Uuid, id: &str, watched: f64, completed: bool) -> VideoWatchSession {
        VideoWatchSession {
            user_id,
            post_id,
            session_id: id.to_string(),
            video_duration: 60.0,
            watched_duration: watched,
            watched_percentage: watched / 60.0 * 100.0,
            play_count: if completed { 2 } else { 1 },
            pause_count: 1,
            seek_count: 0,
            quality_changes: 0,
            volume_changes: 0,
            is_completed: completed,
            exit_point: watched,
            recorded_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        }
    }

    fn aggregator(store: Arc<MemoryStore>) -> VideoMetricsAggregator {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        ));
        VideoMetricsAggregator::new(
            store,
            clock,
            VideoMetricsConfig::default(),
            RetryConfig::disabled(),
        )
    }

    #[test]
    fn test_aggregate_known_sessions() {
        let post = Uuid::new_v4();
        let viewer = Uuid::new_v4();
        let sessions = vec![
            session(post, viewer, "a", 60.0, true),
            session(post, viewer, "b", 30.0, false),
            session(post, Uuid::new_v4(), "c", 15.0, false),
            session(post, Uuid::new_v4(), "d", 15.0, false),
        ];
        let m = aggregate_sessions(post, &sessions, Utc::now());
        assert_eq!(m.total_views, 4);
        assert_eq!(m.unique_viewers, 3);
        assert!((m.average_watch_time - 30.0).abs() < 1e-9);
        assert!((m.completion_rate - 0.25).abs() < 1e-9);
        assert!((m.retention_rate - 50.0).abs() < 1e-9);
        assert!((m.rewatch_rate - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_sessions_yield_zero_metrics() {
        let store = Arc::new(MemoryStore::new());
        let metrics = aggregator(store).recompute(Uuid::new_v4()).await.unwrap();
        assert_eq!(metrics.total_views, 0);
        assert_eq!(metrics.completion_rate, 0.0);
        assert_eq!(metrics.retention_rate, 0.0);
    }

    #[tokio::test]
    async fn test_recompute_is_bit_identical() {
        let store = Arc::new(MemoryStore::new());
        let agg = aggregator(store);
        let post = Uuid::new_v4();
        for (i, watched) in [12.3, 45.6, 7.89, 59.9].into_iter().enumerate() {
            agg.record_watch_session(&session(post, Uuid::new_v4(), &format!("s{}", i), watched, i % 2 == 0))
                .await
                .unwrap();
        }
        let first = agg.recompute(post).await.unwrap();
        let second = agg.recompute(post).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(agg.get_metrics(post).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_get_metrics_does_not_persist() {
        let store = Arc::new(MemoryStore::new());
        let agg = aggregator(store.clone());
        let post = Uuid::new_v4();
        agg.record_watch_session(&session(post, Uuid::new_v4(), "only", 30.0, false))
            .await
            .unwrap();

        let metrics = agg.get_metrics(post).await.unwrap();
        assert_eq!(metrics.total_views, 1);
        let unknown = agg.get_metrics(Uuid::new_v4()).await.unwrap();
        assert_eq!(unknown.total_views, 0);

        assert!(store.get_metrics(post).await.unwrap().is_none());
        assert!(store.get_metrics(unknown.post_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_session_rejected() {
        let store = Arc::new(MemoryStore::new());
        let agg = aggregator(store);
        let mut bad = session(Uuid::new_v4(), Uuid::new_v4(), "x", 10.0, false);
        bad.watched_percentage = 140.0;
        assert!(matches!(
            agg.record_watch_session(&bad).await,
            Err(EngagementError::Validation(_))
        ));
        bad.watched_percentage = 10.0;
        bad.session_id = " ".into();
        assert!(agg.record_watch_session(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_counts_failed_post() {
        let store = Arc::new(MemoryStore::new());
        let agg = aggregator(store.clone());
        let (good, bad) = (Uuid::new_v4(), Uuid::new_v4());
        agg.record_watch_session(&session(good, Uuid::new_v4(), "g", 20.0, false))
            .await
            .unwrap();
        agg.record_watch_session(&session(bad, Uuid::new_v4(), "b", 20.0, false))
            .await
            .unwrap();
        store.fail_sessions_for(bad);

        let report = agg.run_metrics_sweep().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(store.get_metrics(good).await.unwrap().is_some());
    }
}
