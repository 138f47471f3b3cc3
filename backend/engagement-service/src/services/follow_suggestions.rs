//! Follow suggestion generator
//!
//! # Candidate pool
//! - users sharing at least one active interest topic
//! - users followed by the requester's followees (friends of friends)
//! - recently active users
//!
//! # Score
//! `interest_weight * overlap + mutual_weight * mutual + recency_weight * recency`
//! where `recency = exp(-days_since_active * ln 2 / recency_half_life_days)`.
//! The requester and users already followed are never suggested.

use chrono::{DateTime, Duration, Utc};
use resilience::RetryConfig;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{fan_out, with_store_retry, BatchReport};
use crate::clock::{days_between, Clock};
use crate::config::SuggestionConfig;
use crate::error::{EngagementError, Result};
use crate::models::{FollowSuggestion, Subsystem};
use crate::repository::{EventStore, InterestStore, SocialGraph, SuggestionStore};

#[derive(Debug, Default, Clone, Copy)]
struct Signals {
    interest_overlap: u32,
    mutual_follows: u32,
}

/// `exp(-days * ln 2 / half_life)`; 0 when the user was never active
pub fn recency_score(
    last_active: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    half_life_days: f64,
) -> f64 {
    match last_active {
        Some(at) => {
            let days = days_between(at, now);
            (-days * std::f64::consts::LN_2 / half_life_days.max(f64::EPSILON)).exp()
        }
        None => 0.0,
    }
}

fn plural(n: u32, one: &str, many: &str) -> String {
    if n == 1 {
        format!("1 {}", one)
    } else {
        format!("{} {}", n, many)
    }
}

/// e.g. "3 shared interests, 1 mutual connection"
fn reason_for(signals: Signals) -> String {
    let mut parts = Vec::new();
    if signals.interest_overlap > 0 {
        parts.push(plural(
            signals.interest_overlap,
            "shared interest",
            "shared interests",
        ));
    }
    if signals.mutual_follows > 0 {
        parts.push(plural(
            signals.mutual_follows,
            "mutual connection",
            "mutual connections",
        ));
    }
    if parts.is_empty() {
        "recently active".to_string()
    } else {
        parts.join(", ")
    }
}

pub struct FollowSuggestionGenerator {
    interests: Arc<dyn InterestStore>,
    graph: Arc<dyn SocialGraph>,
    events: Arc<dyn EventStore>,
    cache: Arc<dyn SuggestionStore>,
    clock: Arc<dyn Clock>,
    config: SuggestionConfig,
    retry: RetryConfig,
}

impl FollowSuggestionGenerator {
    pub fn new(
        interests: Arc<dyn InterestStore>,
        graph: Arc<dyn SocialGraph>,
        events: Arc<dyn EventStore>,
        cache: Arc<dyn SuggestionStore>,
        clock: Arc<dyn Clock>,
        config: SuggestionConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            interests,
            graph,
            events,
            cache,
            clock,
            config,
            retry,
        }
    }

    /// Ranked suggestions for `user_id`, at most `limit`
    pub async fn generate(&self, user_id: Uuid, limit: usize) -> Result<Vec<FollowSuggestion>> {
        if user_id.is_nil() {
            return Err(EngagementError::validation("user_id must not be nil"));
        }
        with_store_retry(&self.retry, || self.compute_suggestions(user_id, limit)).await
    }

    async fn compute_suggestions(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<FollowSuggestion>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let pool = self.config.recent_pool_size.max(limit);

        let topics: Vec<String> = self
            .interests
            .list_interests(user_id)
            .await?
            .into_iter()
            .filter(|s| !s.is_archived)
            .map(|s| s.topic_id)
            .collect();

        let mut exclude: Vec<Uuid> = self.graph.following(user_id).await?;
        exclude.push(user_id);

        let mut candidates: HashMap<Uuid, Signals> = HashMap::new();

        if !topics.is_empty() {
            for (candidate, overlap) in self
                .interests
                .users_sharing_topics(user_id, &topics, &exclude, pool)
                .await?
            {
                candidates.entry(candidate).or_default().interest_overlap = overlap;
            }
        }

        for (candidate, mutual) in self.graph.followees_of_followees(user_id, pool).await? {
            candidates.entry(candidate).or_default().mutual_follows = mutual;
        }

        let since = now - Duration::days(self.config.active_days);
        let recent = self
            .events
            .recently_active_users(since, &exclude, self.config.recent_pool_size)
            .await?;
        let mut last_active: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        for (candidate, at) in recent {
            candidates.entry(candidate).or_default();
            last_active.insert(candidate, at);
        }

        let excluded: HashSet<Uuid> = exclude.into_iter().collect();
        candidates.retain(|id, _| !excluded.contains(id));

        if candidates.is_empty() {
            debug!(user_id = %user_id, "No suggestion candidates");
            return Ok(Vec::new());
        }

        let unknown: Vec<Uuid> = candidates
            .keys()
            .filter(|id| !last_active.contains_key(id))
            .copied()
            .collect();
        if !unknown.is_empty() {
            last_active.extend(self.events.last_active_at(&unknown).await?);
        }

        let mut suggestions: Vec<FollowSuggestion> = candidates
            .into_iter()
            .map(|(candidate_id, signals)| {
                let recency = recency_score(
                    last_active.get(&candidate_id).copied(),
                    now,
                    self.config.recency_half_life_days,
                );
                let score = self.config.interest_weight * signals.interest_overlap as f64
                    + self.config.mutual_weight * signals.mutual_follows as f64
                    + self.config.recency_weight * recency;
                FollowSuggestion {
                    user_id,
                    candidate_id,
                    score,
                    interest_overlap: signals.interest_overlap,
                    mutual_follows: signals.mutual_follows,
                    recency,
                    reason: reason_for(signals),
                    generated_at: now,
                }
            })
            .collect();

        suggestions.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.candidate_id.cmp(&b.candidate_id))
        });
        suggestions.truncate(limit);

        Ok(suggestions)
    }

    /// Regenerate and cache one user's suggestions
    async fn refresh_user(&self, user_id: Uuid) -> Result<usize> {
        let suggestions = self
            .compute_suggestions(user_id, self.config.suggestions_per_user)
            .await?;
        self.cache.replace_suggestions(user_id, &suggestions).await?;
        Ok(suggestions.len())
    }

    /// Refresh cached suggestions of recently active users
    pub async fn run_suggestion_pass(&self) -> Result<BatchReport> {
        let start = Instant::now();
        let since = self.clock.now() - Duration::days(self.config.active_days);
        let users: Vec<Uuid> = self
            .events
            .recently_active_users(since, &[], self.config.batch_size)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        if users.is_empty() {
            debug!("No active users found, skipping suggestion generation");
            return Ok(BatchReport::default());
        }
        let user_count = users.len();

        let report = fan_out(
            Subsystem::FollowSuggestions,
            users,
            self.config.worker_concurrency,
            |user_id| self.refresh_user(user_id),
        )
        .await;

        info!(
            users = user_count,
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Follow suggestion pass completed"
        );
        Ok(report)
    }

    pub async fn get_cached(&self, user_id: Uuid) -> Result<Vec<FollowSuggestion>> {
        with_store_retry(&self.retry, || self.cache.get_suggestions(user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::repository::MemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap()
    }

    fn generator(store: Arc<MemoryStore>) -> FollowSuggestionGenerator {
        FollowSuggestionGenerator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store,
            Arc::new(ManualClock::new(now())),
            SuggestionConfig::default(),
            RetryConfig::disabled(),
        )
    }

    async fn interested(store: &MemoryStore, user: Uuid, topics: &[&str]) {
        for topic in topics {
            store.reinforce(user, topic, 1.0, now()).await.unwrap();
        }
    }

    #[test]
    fn test_recency_halves_per_half_life() {
        let r = recency_score(Some(now() - Duration::days(7)), now(), 7.0);
        assert!((r - 0.5).abs() < 1e-9);
        assert_eq!(recency_score(Some(now()), now(), 7.0), 1.0);
        assert_eq!(recency_score(None, now(), 7.0), 0.0);
    }

    #[test]
    fn test_reason_text() {
        assert_eq!(
            reason_for(Signals {
                interest_overlap: 3,
                mutual_follows: 1
            }),
            "3 shared interests, 1 mutual connection"
        );
        assert_eq!(reason_for(Signals::default()), "recently active");
    }

    #[tokio::test]
    async fn test_more_shared_interests_rank_higher() {
        let store = Arc::new(MemoryStore::new());
        let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        interested(&store, u1, &["travel", "food", "music"]).await;
        interested(&store, u2, &["travel", "food", "music"]).await;
        interested(&store, u3, &["music"]).await;

        let suggestions = generator(store).generate(u1, 5).await.unwrap();
        let ids: Vec<Uuid> = suggestions.iter().map(|s| s.candidate_id).collect();
        assert_eq!(ids, vec![u2, u3]);
        assert!(suggestions[0].score > suggestions[1].score);
        assert_eq!(suggestions[0].interest_overlap, 3);
        assert_eq!(suggestions[0].reason, "3 shared interests");
    }

    #[tokio::test]
    async fn test_excludes_self_and_followed_users() {
        let store = Arc::new(MemoryStore::new());
        let (me, friend, fof) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.follow(me, friend);
        store.follow(friend, fof);
        store.follow(friend, me);
        interested(&store, me, &["art"]).await;
        interested(&store, friend, &["art"]).await;

        let suggestions = generator(store).generate(me, 10).await.unwrap();
        let ids: Vec<Uuid> = suggestions.iter().map(|s| s.candidate_id).collect();
        assert_eq!(ids, vec![fof]);
        assert_eq!(suggestions[0].mutual_follows, 1);
        assert_eq!(suggestions[0].reason, "1 mutual connection");
    }

    #[tokio::test]
    async fn test_dense_followee_clique_keeps_friends_of_friends() {
        let store = Arc::new(MemoryStore::new());
        let me = Uuid::new_v4();
        let fof = Uuid::new_v4();
        let followees: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for f in &followees {
            store.follow(me, *f);
            store.follow(*f, me);
            for other in &followees {
                if other != f {
                    store.follow(*f, *other);
                }
            }
        }
        store.follow(followees[0], fof);
        store.follow(followees[1], fof);

        let config = SuggestionConfig {
            recent_pool_size: 5,
            ..SuggestionConfig::default()
        };
        let generator = FollowSuggestionGenerator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store,
            Arc::new(ManualClock::new(now())),
            config,
            RetryConfig::disabled(),
        );

        let suggestions = generator.generate(me, 5).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].candidate_id, fof);
        assert_eq!(suggestions[0].mutual_follows, 2);
        assert_eq!(suggestions[0].reason, "2 mutual connections");
    }

    #[tokio::test]
    async fn test_no_candidates_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let suggestions = generator(store).generate(Uuid::new_v4(), 5).await.unwrap();
        assert!(suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_ties_break_on_lower_user_id() {
        let store = Arc::new(MemoryStore::new());
        let me = Uuid::new_v4();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        interested(&store, me, &["go"]).await;
        interested(&store, b, &["go"]).await;
        interested(&store, a, &["go"]).await;

        let suggestions = generator(store).generate(me, 1).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].candidate_id, a);
    }
}
