// ============================================
// Post Attractiveness Scorer
// ============================================
//
// raw        = SUM(weight[kind] * count[kind])
// normalized = raw / ((1 + age_hours / age_scale_hours) * (1 + ln(1 + views)))

use chrono::{DateTime, Duration, Utc};
use resilience::RetryConfig;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{fan_out, with_store_retry, BatchReport};
use crate::clock::Clock;
use crate::config::{AttractivenessConfig, EngagementWeights};
use crate::error::{EngagementError, Result};
use crate::models::{EngagementCounts, EngagementKind, PostAttractivenessScore, Subsystem};
use crate::repository::{AttractivenessStore, EventStore};

pub fn raw_score(counts: &EngagementCounts, weights: &EngagementWeights) -> f64 {
    EngagementKind::ALL
        .iter()
        .map(|kind| weights.weight(*kind) * counts.get(*kind) as f64)
        .sum()
}

pub fn normalized_score(raw: f64, age_hours: f64, views: i64, age_scale_hours: f64) -> f64 {
    let age_factor = 1.0 + age_hours.max(0.0) / age_scale_hours.max(f64::EPSILON);
    let view_factor = 1.0 + (1.0 + views.max(0) as f64).ln();
    raw / (age_factor * view_factor)
}

pub struct AttractivenessScorer {
    events: Arc<dyn EventStore>,
    scores: Arc<dyn AttractivenessStore>,
    clock: Arc<dyn Clock>,
    config: AttractivenessConfig,
    retry: RetryConfig,
}

impl AttractivenessScorer {
    pub fn new(
        events: Arc<dyn EventStore>,
        scores: Arc<dyn AttractivenessStore>,
        clock: Arc<dyn Clock>,
        config: AttractivenessConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            events,
            scores,
            clock,
            config,
            retry,
        }
    }

    fn compute(
        &self,
        post_id: Uuid,
        counts: EngagementCounts,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PostAttractivenessScore> {
        let raw = raw_score(&counts, &self.config.weights);
        let age_hours = (now - created_at).num_seconds().max(0) as f64 / 3600.0;
        let normalized = normalized_score(raw, age_hours, counts.views, self.config.age_scale_hours);

        if !raw.is_finite() || !normalized.is_finite() {
            return Err(EngagementError::Computation(format!(
                "non-finite attractiveness for post {}",
                post_id
            )));
        }

        Ok(PostAttractivenessScore {
            post_id,
            counts,
            raw_score: raw,
            normalized_score: normalized,
            weights_version: self.config.weights_version,
            computed_at: now,
        })
    }

    /// Recompute and upsert one post's score
    pub async fn score(&self, post_id: Uuid) -> Result<PostAttractivenessScore> {
        let created_at = self
            .scores
            .post_created_at(post_id)
            .await?
            .ok_or_else(|| EngagementError::not_found(format!("post {}", post_id)))?;
        let counts = self.events.engagement_counts(post_id).await?;

        let score = self.compute(post_id, counts, created_at, self.clock.now())?;
        self.scores.upsert_score(&score).await?;

        debug!(
            post_id = %post_id,
            raw_score = score.raw_score,
            normalized_score = score.normalized_score,
            "Post attractiveness scored"
        );
        Ok(score)
    }

    /// Stored score, computed on demand when absent
    pub async fn get_score(&self, post_id: Uuid) -> Result<PostAttractivenessScore> {
        match with_store_retry(&self.retry, || self.scores.get_score(post_id)).await? {
            Some(score) => Ok(score),
            None => with_store_retry(&self.retry, || self.score(post_id)).await,
        }
    }

    /// Rescore posts engaged with inside the active window
    pub async fn run_scoring_sweep(&self) -> Result<BatchReport> {
        let start = Instant::now();
        let since = self.clock.now() - Duration::hours(self.config.active_window_hours);
        let posts = self
            .events
            .posts_engaged_since(since, self.config.max_posts_per_cycle)
            .await?;
        let post_count = posts.len();

        let report = fan_out(
            Subsystem::PostAttractiveness,
            posts,
            self.config.worker_concurrency,
            |post_id| self.score(post_id),
        )
        .await;

        info!(
            posts = post_count,
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Attractiveness sweep completed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::InteractionEvent;
    use crate::repository::MemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn scorer(store: Arc<MemoryStore>) -> AttractivenessScorer {
        AttractivenessScorer::new(
            store.clone(),
            store,
            Arc::new(ManualClock::new(now())),
            AttractivenessConfig::default(),
            RetryConfig::disabled(),
        )
    }

    async fn engage(store: &MemoryStore, post_id: Uuid, kind: EngagementKind, n: usize) {
        for _ in 0..n {
            store
                .append_interaction(&InteractionEvent {
                    user_id: Uuid::new_v4(),
                    post_id,
                    post_author_id: Uuid::new_v4(),
                    kind,
                    topics: vec![],
                    occurred_at: now(),
                })
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_normalization_of_fresh_unviewed_post_is_identity() {
        assert_eq!(normalized_score(42.0, 0.0, 0, 24.0), 42.0);
        // one age scale halves the score
        let aged = normalized_score(42.0, 24.0, 0, 24.0);
        assert!((aged - 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_share_outweighs_comment_outweighs_like() {
        let weights = EngagementWeights::default();
        let mut share = EngagementCounts::default();
        share.add(EngagementKind::Share, 1);
        let mut comment = EngagementCounts::default();
        comment.add(EngagementKind::Comment, 1);
        let mut like = EngagementCounts::default();
        like.add(EngagementKind::Like, 1);
        assert!(raw_score(&share, &weights) > raw_score(&comment, &weights));
        assert!(raw_score(&comment, &weights) > raw_score(&like, &weights));
    }

    #[tokio::test]
    async fn test_unknown_post_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let err = scorer(store).score(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngagementError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_score_weights_counts_and_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let post = Uuid::new_v4();
        store.register_post(post, now() - Duration::hours(12));
        engage(&store, post, EngagementKind::View, 4).await;
        engage(&store, post, EngagementKind::Like, 2).await;
        engage(&store, post, EngagementKind::Share, 1).await;

        let scorer = scorer(store.clone());
        let score = scorer.score(post).await.unwrap();
        assert_eq!(score.raw_score, 4.0 + 6.0 + 8.0);
        let expected = 18.0 / (1.5 * (1.0 + 5f64.ln()));
        assert!((score.normalized_score - expected).abs() < 1e-9);
        assert_eq!(score.weights_version, 1);
        assert_eq!(scorer.get_score(post).await.unwrap(), score);
    }

    #[tokio::test]
    async fn test_raw_score_never_decreases_across_sweeps() {
        let store = Arc::new(MemoryStore::new());
        let post = Uuid::new_v4();
        store.register_post(post, now() - Duration::hours(1));
        engage(&store, post, EngagementKind::Comment, 1).await;

        let scorer = scorer(store.clone());
        let report = scorer.run_scoring_sweep().await.unwrap();
        assert_eq!(report.succeeded, 1);
        let before = store.get_score(post).await.unwrap().unwrap().raw_score;

        engage(&store, post, EngagementKind::View, 3).await;
        scorer.run_scoring_sweep().await.unwrap();
        let after = store.get_score(post).await.unwrap().unwrap().raw_score;
        assert!(after >= before);
    }
}
