// ============================================
// Interest Decay Engine
// ============================================
//
// Per-user, per-topic affinities that fade unless reinforced.
//
// decayed = raw * exp(-lambda * days_since_last_reinforcement)
// lambda  = ln 2 / half_life_days
//
// Lifecycle of one entry:
//   reinforce   -> raw += weight, decayed = raw, revived if archived
//   decay pass  -> decayed recomputed; archived below archive_threshold;
//                  deleted once archived for deletion_grace_days and
//                  below delete_threshold

use chrono::{DateTime, Duration, Utc};
use resilience::RetryConfig;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{fan_out, with_store_retry, BatchReport};
use crate::clock::{days_between, Clock};
use crate::config::{ClusteringConfig, DecayConfig, ScrollConfig};
use crate::error::{EngagementError, Result};
use crate::models::{ContentCluster, InteractionEvent, InterestScore, ScrollEvent, Subsystem};
use crate::repository::{EventStore, InterestStore};

/// `raw * exp(-lambda * days)`; days below zero count as zero
pub fn decayed_score(raw_score: f64, lambda: f64, days: f64) -> f64 {
    raw_score * (-lambda * days.max(0.0)).exp()
}

/// What one decay pass did to one user's scores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayOutcome {
    pub updated: usize,
    pub archived: usize,
    pub deleted: usize,
}

pub struct InterestDecayEngine {
    interests: Arc<dyn InterestStore>,
    events: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    decay: DecayConfig,
    clustering: ClusteringConfig,
    scroll: ScrollConfig,
    retry: RetryConfig,
}

impl InterestDecayEngine {
    pub fn new(
        interests: Arc<dyn InterestStore>,
        events: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        decay: DecayConfig,
        clustering: ClusteringConfig,
        scroll: ScrollConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            interests,
            events,
            clock,
            decay,
            clustering,
            scroll,
            retry,
        }
    }

    /// Add `weight` to the user's affinity for `topic_id`
    pub async fn reinforce(
        &self,
        user_id: Uuid,
        topic_id: &str,
        weight: f64,
    ) -> Result<InterestScore> {
        if user_id.is_nil() {
            return Err(EngagementError::validation("user_id must not be nil"));
        }
        let topic = topic_id.trim();
        if topic.is_empty() {
            return Err(EngagementError::validation("topic_id must not be empty"));
        }
        if !weight.is_finite() || weight <= 0.0 {
            return Err(EngagementError::validation(format!(
                "reinforcement weight must be a positive number, got {}",
                weight
            )));
        }

        let now = self.clock.now();
        let score = with_store_retry(&self.retry, || {
            self.interests.reinforce(user_id, topic, weight, now)
        })
        .await?;

        debug!(
            user_id = %user_id,
            topic_id = %topic,
            weight = weight,
            raw_score = score.raw_score,
            "Interest reinforced"
        );
        Ok(score)
    }

    /// Append an interaction event and reinforce every topic of the post
    pub async fn ingest_interaction(&self, event: &InteractionEvent) -> Result<Vec<InterestScore>> {
        if event.user_id.is_nil() || event.post_id.is_nil() || event.post_author_id.is_nil() {
            return Err(EngagementError::validation(
                "interaction event ids must not be nil",
            ));
        }
        let event = InteractionEvent {
            topics: normalize_topics(&event.topics),
            ..event.clone()
        };

        with_store_retry(&self.retry, || self.events.append_interaction(&event)).await?;

        let mut reinforced = Vec::with_capacity(event.topics.len());
        for topic in &event.topics {
            reinforced.push(
                self.reinforce(event.user_id, topic, event.kind.interest_weight())
                    .await?,
            );
        }
        Ok(reinforced)
    }

    /// Append a scroll event; reinforce its topics when the scroll qualifies
    pub async fn ingest_scroll(&self, event: &ScrollEvent) -> Result<Vec<InterestScore>> {
        if event.user_id.is_nil() || event.post_id.is_nil() {
            return Err(EngagementError::validation("scroll event ids must not be nil"));
        }
        if !(0.0..=1.0).contains(&event.scroll_depth) {
            return Err(EngagementError::validation(format!(
                "scroll_depth must be within 0..=1, got {}",
                event.scroll_depth
            )));
        }
        let event = ScrollEvent {
            topics: normalize_topics(&event.topics),
            ..event.clone()
        };

        with_store_retry(&self.retry, || self.events.append_scroll(&event)).await?;

        if event.scroll_depth < self.scroll.min_scroll_depth
            || event.dwell_ms < self.scroll.min_dwell_ms
        {
            return Ok(Vec::new());
        }

        let mut reinforced = Vec::with_capacity(event.topics.len());
        for topic in &event.topics {
            reinforced.push(
                self.reinforce(event.user_id, topic, self.scroll.scroll_weight)
                    .await?,
            );
        }
        Ok(reinforced)
    }

    /// Non-archived scores, strongest first (ties by topic)
    pub async fn get_active_interests(&self, user_id: Uuid) -> Result<Vec<InterestScore>> {
        let mut active: Vec<InterestScore> =
            with_store_retry(&self.retry, || self.interests.list_interests(user_id))
                .await?
                .into_iter()
                .filter(|s| !s.is_archived)
                .collect();

        active.sort_by(|a, b| {
            b.decayed_score
                .partial_cmp(&a.decayed_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.topic_id.cmp(&b.topic_id))
        });
        Ok(active)
    }

    pub async fn get_content_clusters(&self, user_id: Uuid) -> Result<Vec<ContentCluster>> {
        with_store_retry(&self.retry, || self.interests.list_clusters(user_id)).await
    }

    /// Recompute decay for every user.
    ///
    /// Fails as a whole only when the user list cannot be read.
    pub async fn run_decay_pass(&self) -> Result<BatchReport> {
        let start = Instant::now();
        let now = self.clock.now();
        let users = self.interests.users_with_interests().await?;
        let user_count = users.len();

        let report = fan_out(
            Subsystem::InterestDecay,
            users,
            self.decay.worker_concurrency,
            |user_id| self.decay_user(user_id, now),
        )
        .await;

        info!(
            users = user_count,
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Interest decay pass completed"
        );
        Ok(report)
    }

    /// Decay one user's scores as of `now` and write them in one batch
    pub async fn decay_user(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<DecayOutcome> {
        let scores = self.interests.list_interests(user_id).await?;
        let lambda = self.decay.lambda();

        let mut outcome = DecayOutcome::default();
        let mut updates = Vec::new();
        let mut deletions = Vec::new();

        for current in scores {
            let days = days_between(current.last_reinforced_at, now);
            let decayed = decayed_score(current.raw_score, lambda, days);

            let mut next = current.clone();
            next.decayed_score = decayed;
            next.needs_recalculation = false;

            if !next.is_archived && decayed < self.decay.archive_threshold {
                next.is_archived = true;
                next.archived_at = Some(now);
                outcome.archived += 1;
            } else if next.is_archived && decayed < self.decay.delete_threshold {
                let archived_for = next
                    .archived_at
                    .map(|at| now - at)
                    .unwrap_or_else(Duration::zero);
                if archived_for >= Duration::days(self.decay.deletion_grace_days) {
                    deletions.push(next);
                    outcome.deleted += 1;
                    continue;
                }
            }

            if next != current {
                updates.push(next);
                outcome.updated += 1;
            }
        }

        if !updates.is_empty() || !deletions.is_empty() {
            self.interests
                .apply_decay(user_id, &updates, &deletions)
                .await?;
        }

        debug!(
            user_id = %user_id,
            updated = outcome.updated,
            archived = outcome.archived,
            deleted = outcome.deleted,
            "User interests decayed"
        );
        Ok(outcome)
    }

    /// Recluster every user with at least one score
    pub async fn run_clustering_pass(&self) -> Result<BatchReport> {
        let users = self.interests.users_with_interests().await?;
        let report = fan_out(
            Subsystem::InterestDecay,
            users,
            self.decay.worker_concurrency,
            |user_id| self.clusterize(user_id),
        )
        .await;

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Interest clustering pass completed"
        );
        Ok(report)
    }

    /// Group the user's active topics by co-occurrence and replace the
    /// stored clusters
    pub async fn clusterize(&self, user_id: Uuid) -> Result<Vec<ContentCluster>> {
        let now = self.clock.now();
        let active: BTreeMap<String, f64> = self
            .interests
            .list_interests(user_id)
            .await?
            .into_iter()
            .filter(|s| !s.is_archived)
            .map(|s| (s.topic_id, s.decayed_score))
            .collect();

        let since = now - Duration::days(self.clustering.lookback_days);
        let events = if active.is_empty() {
            Vec::new()
        } else {
            self.events.interactions_for_user(user_id, since).await?
        };

        let clusters = build_clusters(
            user_id,
            &active,
            events.iter().map(|e| e.topics.as_slice()),
            self.clustering.min_cooccurrence,
            now,
        );

        self.interests.replace_clusters(user_id, &clusters).await?;

        debug!(
            user_id = %user_id,
            topics = active.len(),
            clusters = clusters.len(),
            "User interests clustered"
        );
        Ok(clusters)
    }
}

/// Trimmed, non-empty, deduplicated topics in first-seen order
fn normalize_topics(topics: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    topics
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty() && seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

/// Connected components of the topic co-occurrence graph.
///
/// Two active topics are linked when they appear together on at least
/// `min_cooccurrence` events. Every active topic lands in exactly one
/// cluster; unlinked topics form singletons.
pub fn build_clusters<'a>(
    user_id: Uuid,
    active: &BTreeMap<String, f64>,
    event_topics: impl Iterator<Item = &'a [String]>,
    min_cooccurrence: u32,
    now: DateTime<Utc>,
) -> Vec<ContentCluster> {
    let topics: Vec<&String> = active.keys().collect();
    let index: HashMap<&str, usize> = topics
        .iter()
        .enumerate()
        .map(|(i, t)| (t.as_str(), i))
        .collect();

    let mut pair_counts: HashMap<(usize, usize), u32> = HashMap::new();
    for tags in event_topics {
        let ids: BTreeSet<usize> = tags
            .iter()
            .filter_map(|t| index.get(t.trim()).copied())
            .collect();
        let ids: Vec<usize> = ids.into_iter().collect();
        for (pos, &a) in ids.iter().enumerate() {
            for &b in &ids[pos + 1..] {
                *pair_counts.entry((a, b)).or_default() += 1;
            }
        }
    }

    let mut sets = DisjointSets::new(topics.len());
    for ((a, b), count) in pair_counts {
        if count >= min_cooccurrence.max(1) {
            sets.union(a, b);
        }
    }

    let mut groups: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
    for (i, topic) in topics.iter().enumerate() {
        groups.entry(sets.find(i)).or_default().insert((*topic).clone());
    }

    let mut clusters: Vec<ContentCluster> = groups
        .into_values()
        .map(|members| {
            let total: f64 = members.iter().filter_map(|t| active.get(t)).sum();
            let centroid_score = total / members.len() as f64;
            let key = members.iter().cloned().collect::<Vec<_>>().join("\u{1f}");
            ContentCluster {
                cluster_id: Uuid::new_v5(&user_id, key.as_bytes()),
                user_id,
                member_topic_ids: members,
                centroid_score,
                created_at: now,
            }
        })
        .collect();

    clusters.sort_by(|a, b| {
        b.centroid_score
            .partial_cmp(&a.centroid_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.member_topic_ids.cmp(&b.member_topic_ids))
    });
    clusters
}

/// Union-find with path halving
struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[high] = low;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::EngagementKind;
    use crate::repository::MemoryStore;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn engine(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> InterestDecayEngine {
        InterestDecayEngine::new(
            store.clone(),
            store,
            clock,
            DecayConfig::default(),
            ClusteringConfig::default(),
            ScrollConfig::default(),
            RetryConfig::disabled(),
        )
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_decay_halves_after_one_half_life() {
        let lambda = DecayConfig::default().lambda();
        let half = decayed_score(8.0, lambda, 14.0);
        assert!((half - 4.0).abs() < 1e-9);
        assert_eq!(decayed_score(8.0, lambda, -3.0), 8.0);
    }

    #[tokio::test]
    async fn test_reinforce_rejects_bad_input() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Arc::new(ManualClock::new(start())));
        let user = Uuid::new_v4();

        for (topic, weight) in [("  ", 1.0), ("travel", 0.0), ("travel", -2.0), ("travel", f64::NAN)] {
            let err = engine.reinforce(user, topic, weight).await.unwrap_err();
            assert!(matches!(err, EngagementError::Validation(_)), "{} {}", topic, weight);
        }
        assert!(engine.reinforce(Uuid::nil(), "travel", 1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_decay_pass_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store.clone(), clock.clone());
        let user = Uuid::new_v4();

        engine.reinforce(user, "music", 6.0).await.unwrap();
        clock.advance(Duration::days(5));

        engine.run_decay_pass().await.unwrap();
        let first = store.get_interest(user, "music").await.unwrap().unwrap();
        engine.run_decay_pass().await.unwrap();
        let second = store.get_interest(user, "music").await.unwrap().unwrap();

        assert_eq!(first.decayed_score, second.decayed_score);
        assert!(first.decayed_score < first.raw_score);
        assert!(!first.needs_recalculation);
    }

    #[tokio::test]
    async fn test_archived_entry_is_deleted_after_grace_period() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store.clone(), clock.clone());
        let user = Uuid::new_v4();

        engine.reinforce(user, "knitting", 1.0).await.unwrap();
        clock.advance(Duration::days(60));
        let outcome = engine.decay_user(user, clock.now()).await.unwrap();
        assert_eq!(outcome.archived, 1);

        // below the delete floor but not yet archived for the grace period
        clock.advance(Duration::days(10));
        engine.run_decay_pass().await.unwrap();
        assert!(store.get_interest(user, "knitting").await.unwrap().is_some());

        clock.advance(Duration::days(25));
        engine.run_decay_pass().await.unwrap();
        assert!(store.get_interest(user, "knitting").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reinforce_revives_archived_entry() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store.clone(), clock.clone());
        let user = Uuid::new_v4();

        engine.reinforce(user, "chess", 2.0).await.unwrap();
        clock.advance(Duration::days(40));
        engine.run_decay_pass().await.unwrap();
        assert!(engine.get_active_interests(user).await.unwrap().is_empty());

        let revived = engine.reinforce(user, "chess", 1.0).await.unwrap();
        assert!(!revived.is_archived);
        assert_eq!(revived.raw_score, 3.0);
        assert_eq!(revived.decayed_score, 3.0);
        assert_eq!(engine.get_active_interests(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_qualifying_scroll_reinforces_topics() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store.clone(), clock.clone());
        let user = Uuid::new_v4();

        let mut scroll = ScrollEvent {
            user_id: user,
            post_id: Uuid::new_v4(),
            scroll_depth: 0.4,
            dwell_ms: 10_000,
            topics: topics(&["food"]),
            occurred_at: clock.now(),
        };
        assert!(engine.ingest_scroll(&scroll).await.unwrap().is_empty());

        scroll.scroll_depth = 0.9;
        let reinforced = engine.ingest_scroll(&scroll).await.unwrap();
        assert_eq!(reinforced.len(), 1);
        assert!((reinforced[0].raw_score - 0.3).abs() < 1e-12);

        scroll.scroll_depth = 1.5;
        assert!(engine.ingest_scroll(&scroll).await.is_err());
    }

    #[tokio::test]
    async fn test_clusterize_groups_cooccurring_topics() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store.clone(), clock.clone());
        let user = Uuid::new_v4();
        let author = Uuid::new_v4();

        let posts = [
            topics(&["travel", "food"]),
            topics(&["travel", "food", "photography"]),
            topics(&["photography"]),
            topics(&["rust"]),
        ];
        for tags in posts {
            engine
                .ingest_interaction(&InteractionEvent {
                    user_id: user,
                    post_id: Uuid::new_v4(),
                    post_author_id: author,
                    kind: EngagementKind::Like,
                    topics: tags,
                    occurred_at: clock.now(),
                })
                .await
                .unwrap();
        }

        let clusters = engine.clusterize(user).await.unwrap();
        let members: Vec<Vec<&str>> = clusters
            .iter()
            .map(|c| c.member_topic_ids.iter().map(String::as_str).collect())
            .collect();

        assert_eq!(clusters.len(), 3);
        assert!(members.contains(&vec!["food", "travel"]));
        assert!(members.contains(&vec!["photography"]));
        assert!(members.contains(&vec!["rust"]));

        // recomputation replaces, with stable ids
        let again = engine.clusterize(user).await.unwrap();
        assert_eq!(engine.get_content_clusters(user).await.unwrap(), again);
        assert_eq!(
            clusters.iter().map(|c| c.cluster_id).collect::<Vec<_>>(),
            again.iter().map(|c| c.cluster_id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_decay_pass_counts_failing_user() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(store.clone(), clock.clone());
        let (ok_user, bad_user) = (Uuid::new_v4(), Uuid::new_v4());

        engine.reinforce(ok_user, "art", 3.0).await.unwrap();
        engine.reinforce(bad_user, "art", 3.0).await.unwrap();
        store.fail_decay_for(bad_user);
        clock.advance(Duration::days(1));

        let report = engine.run_decay_pass().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
    }
}
