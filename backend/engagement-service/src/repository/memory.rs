//! In-process store.
//!
//! Backs single-instance development runs (`STORAGE_BACKEND=memory`) and the
//! test suites. A single `RwLock` around the whole state makes every method
//! atomic, which is what the traits require of per-entity writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

use super::{
    AttractivenessStore, EventStore, InterestStore, RelationStore, RunRecordStore, SocialGraph,
    SuggestionStore, VideoStore,
};
use crate::error::{EngagementError, Result};
use crate::models::{
    BestFriendRelation, ContentCluster, EngagementCounts, FollowSuggestion, InteractionEvent,
    InterestScore, JobRunRecord, PairKey, PairwiseInteraction, PermissionAction,
    PermissionRequest, PermissionStatus, PostAttractivenessScore, RelationStatus, ScrollEvent,
    Subsystem, VideoMetrics, VideoWatchSession,
};

#[derive(Default)]
struct State {
    interactions: Vec<InteractionEvent>,
    scrolls: Vec<ScrollEvent>,
    pairwise: Vec<PairwiseInteraction>,
    interests: BTreeMap<(Uuid, String), InterestScore>,
    clusters: HashMap<Uuid, Vec<ContentCluster>>,
    /// keyed by (post, user, session)
    sessions: BTreeMap<(Uuid, Uuid, String), VideoWatchSession>,
    video_metrics: HashMap<Uuid, VideoMetrics>,
    posts: HashMap<Uuid, DateTime<Utc>>,
    scores: HashMap<Uuid, PostAttractivenessScore>,
    follows: HashMap<Uuid, BTreeSet<Uuid>>,
    suggestions: HashMap<Uuid, Vec<FollowSuggestion>>,
    relations: BTreeMap<PairKey, BestFriendRelation>,
    /// ended incarnations replaced by a reopened pair
    relation_history: HashMap<Uuid, BestFriendRelation>,
    requests: HashMap<Uuid, PermissionRequest>,
    runs: Vec<JobRunRecord>,
}

#[derive(Default)]
struct Faults {
    unavailable: bool,
    decay_users: HashSet<Uuid>,
    video_posts: HashSet<Uuid>,
    interaction_writes: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    faults: RwLock<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a post and its creation time (owned by the content service)
    pub fn register_post(&self, post_id: Uuid, created_at: DateTime<Utc>) {
        self.state.write().posts.insert(post_id, created_at);
    }

    /// Record a follow edge (owned by the social graph service)
    pub fn follow(&self, follower_id: Uuid, followee_id: Uuid) {
        self.state
            .write()
            .follows
            .entry(follower_id)
            .or_default()
            .insert(followee_id);
    }

    /// Make every call fail with a transient store error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.write().unavailable = unavailable;
    }

    /// Make decay writes for one user fail
    pub fn fail_decay_for(&self, user_id: Uuid) {
        self.faults.write().decay_users.insert(user_id);
    }

    /// Make session reads for one post fail
    pub fn fail_sessions_for(&self, post_id: Uuid) {
        self.faults.write().video_posts.insert(post_id);
    }

    /// Make every relation write that carries an interaction fail
    pub fn fail_interaction_writes(&self, fail: bool) {
        self.faults.write().interaction_writes = fail;
    }

    fn write_relation(state: &mut State, relation: &BestFriendRelation) -> Result<()> {
        let pair = relation.pair();
        let stored = state.relations.get(&pair);
        let stored_version = stored.map(|r| r.version).unwrap_or(0);
        if relation.version != stored_version + 1 {
            return Err(EngagementError::Conflict(format!(
                "relation {} is at version {}, write carried {}",
                pair, stored_version, relation.version
            )));
        }
        if let Some(replaced) = state.relations.insert(pair, relation.clone()) {
            if replaced.id != relation.id {
                state.relation_history.insert(replaced.id, replaced);
            }
        }
        Ok(())
    }

    fn check_available(&self) -> Result<()> {
        if self.faults.read().unavailable {
            return Err(EngagementError::store("memory store marked unavailable"));
        }
        Ok(())
    }

    fn activity(state: &State) -> HashMap<Uuid, DateTime<Utc>> {
        let mut latest: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        let mut touch = |user: Uuid, at: DateTime<Utc>| {
            latest
                .entry(user)
                .and_modify(|t| {
                    if at > *t {
                        *t = at
                    }
                })
                .or_insert(at);
        };
        for e in &state.interactions {
            touch(e.user_id, e.occurred_at);
        }
        for e in &state.scrolls {
            touch(e.user_id, e.occurred_at);
        }
        for s in state.sessions.values() {
            touch(s.user_id, s.recorded_at);
        }
        for p in &state.pairwise {
            touch(p.actor_id, p.occurred_at);
        }
        latest
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_interaction(&self, event: &InteractionEvent) -> Result<()> {
        self.check_available()?;
        self.state.write().interactions.push(event.clone());
        Ok(())
    }

    async fn append_scroll(&self, event: &ScrollEvent) -> Result<()> {
        self.check_available()?;
        self.state.write().scrolls.push(event.clone());
        Ok(())
    }

    async fn interactions_for_user(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .interactions
            .iter()
            .filter(|e| e.user_id == user_id && e.occurred_at >= since)
            .cloned()
            .collect())
    }

    async fn engagement_counts(&self, post_id: Uuid) -> Result<EngagementCounts> {
        self.check_available()?;
        let mut counts = EngagementCounts::default();
        for e in self
            .state
            .read()
            .interactions
            .iter()
            .filter(|e| e.post_id == post_id)
        {
            counts.add(e.kind, 1);
        }
        Ok(counts)
    }

    async fn posts_engaged_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        self.check_available()?;
        let state = self.state.read();
        let mut latest: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        for e in state.interactions.iter().filter(|e| e.occurred_at >= since) {
            let entry = latest.entry(e.post_id).or_insert(e.occurred_at);
            if e.occurred_at > *entry {
                *entry = e.occurred_at;
            }
        }
        let mut posts: Vec<(Uuid, DateTime<Utc>)> = latest.into_iter().collect();
        posts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(posts.into_iter().take(limit).map(|(id, _)| id).collect())
    }

    async fn recently_active_users(
        &self,
        since: DateTime<Utc>,
        exclude: &[Uuid],
        limit: usize,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        self.check_available()?;
        let state = self.state.read();
        let mut users: Vec<(Uuid, DateTime<Utc>)> = Self::activity(&state)
            .into_iter()
            .filter(|(id, at)| *at >= since && !exclude.contains(id))
            .collect();
        users.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        users.truncate(limit);
        Ok(users)
    }

    async fn last_active_at(&self, user_ids: &[Uuid]) -> Result<HashMap<Uuid, DateTime<Utc>>> {
        self.check_available()?;
        let wanted: HashSet<&Uuid> = user_ids.iter().collect();
        let state = self.state.read();
        Ok(Self::activity(&state)
            .into_iter()
            .filter(|(id, _)| wanted.contains(id))
            .collect())
    }

    async fn count_pairwise(
        &self,
        relation_id: Uuid,
        actor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .pairwise
            .iter()
            .filter(|p| {
                p.relation_id == relation_id && p.actor_id == actor_id && p.occurred_at >= since
            })
            .count() as u32)
    }
}

#[async_trait]
impl InterestStore for MemoryStore {
    async fn get_interest(&self, user_id: Uuid, topic_id: &str) -> Result<Option<InterestScore>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .interests
            .get(&(user_id, topic_id.to_string()))
            .cloned())
    }

    async fn reinforce(
        &self,
        user_id: Uuid,
        topic_id: &str,
        weight: f64,
        now: DateTime<Utc>,
    ) -> Result<InterestScore> {
        self.check_available()?;
        let mut state = self.state.write();
        let score = state
            .interests
            .entry((user_id, topic_id.to_string()))
            .or_insert_with(|| InterestScore::new(user_id, topic_id, now));
        score.raw_score += weight;
        score.decayed_score = score.raw_score;
        score.last_reinforced_at = now;
        score.needs_recalculation = true;
        score.is_archived = false;
        score.archived_at = None;
        score.reinforcement_count += 1;
        Ok(score.clone())
    }

    async fn list_interests(&self, user_id: Uuid) -> Result<Vec<InterestScore>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .interests
            .range((user_id, String::new())..)
            .take_while(|((u, _), _)| *u == user_id)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn users_with_interests(&self) -> Result<Vec<Uuid>> {
        self.check_available()?;
        let users: BTreeSet<Uuid> = self.state.read().interests.keys().map(|(u, _)| *u).collect();
        Ok(users.into_iter().collect())
    }

    async fn apply_decay(
        &self,
        user_id: Uuid,
        updates: &[InterestScore],
        deletions: &[InterestScore],
    ) -> Result<()> {
        self.check_available()?;
        if self.faults.read().decay_users.contains(&user_id) {
            return Err(EngagementError::store(format!(
                "injected decay failure for {}",
                user_id
            )));
        }
        let mut state = self.state.write();
        for update in updates {
            let key = (update.user_id, update.topic_id.clone());
            if let Some(current) = state.interests.get_mut(&key) {
                if current.last_reinforced_at == update.last_reinforced_at {
                    current.decayed_score = update.decayed_score;
                    current.is_archived = update.is_archived;
                    current.archived_at = update.archived_at;
                    current.needs_recalculation = update.needs_recalculation;
                }
            }
        }
        for deletion in deletions {
            let key = (deletion.user_id, deletion.topic_id.clone());
            let unchanged = state
                .interests
                .get(&key)
                .map(|c| c.is_archived && c.last_reinforced_at == deletion.last_reinforced_at)
                .unwrap_or(false);
            if unchanged {
                state.interests.remove(&key);
            }
        }
        Ok(())
    }

    async fn replace_clusters(&self, user_id: Uuid, clusters: &[ContentCluster]) -> Result<()> {
        self.check_available()?;
        self.state
            .write()
            .clusters
            .insert(user_id, clusters.to_vec());
        Ok(())
    }

    async fn list_clusters(&self, user_id: Uuid) -> Result<Vec<ContentCluster>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .clusters
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn users_sharing_topics(
        &self,
        user_id: Uuid,
        topics: &[String],
        exclude: &[Uuid],
        limit: usize,
    ) -> Result<Vec<(Uuid, u32)>> {
        self.check_available()?;
        let wanted: HashSet<&str> = topics.iter().map(String::as_str).collect();
        let mut overlap: HashMap<Uuid, u32> = HashMap::new();
        for ((owner, topic), score) in self.state.read().interests.iter() {
            if *owner != user_id
                && !exclude.contains(owner)
                && !score.is_archived
                && wanted.contains(topic.as_str())
            {
                *overlap.entry(*owner).or_default() += 1;
            }
        }
        let mut users: Vec<(Uuid, u32)> = overlap.into_iter().collect();
        users.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        users.truncate(limit);
        Ok(users)
    }
}

#[async_trait]
impl VideoStore for MemoryStore {
    async fn append_session(&self, session: &VideoWatchSession) -> Result<bool> {
        self.check_available()?;
        let key = (session.post_id, session.user_id, session.session_id.clone());
        let mut state = self.state.write();
        if state.sessions.contains_key(&key) {
            return Ok(false);
        }
        state.sessions.insert(key, session.clone());
        Ok(true)
    }

    async fn sessions_for_post(&self, post_id: Uuid) -> Result<Vec<VideoWatchSession>> {
        self.check_available()?;
        if self.faults.read().video_posts.contains(&post_id) {
            return Err(EngagementError::store(format!(
                "injected session read failure for {}",
                post_id
            )));
        }
        Ok(self
            .state
            .read()
            .sessions
            .range((post_id, Uuid::nil(), String::new())..)
            .take_while(|((p, _, _), _)| *p == post_id)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn posts_watched_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        self.check_available()?;
        let state = self.state.read();
        let mut latest: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        for s in state.sessions.values().filter(|s| s.recorded_at >= since) {
            let entry = latest.entry(s.post_id).or_insert(s.recorded_at);
            if s.recorded_at > *entry {
                *entry = s.recorded_at;
            }
        }
        let mut posts: Vec<(Uuid, DateTime<Utc>)> = latest.into_iter().collect();
        posts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(posts.into_iter().take(limit).map(|(id, _)| id).collect())
    }

    async fn upsert_metrics(&self, metrics: &VideoMetrics) -> Result<()> {
        self.check_available()?;
        self.state
            .write()
            .video_metrics
            .insert(metrics.post_id, metrics.clone());
        Ok(())
    }

    async fn get_metrics(&self, post_id: Uuid) -> Result<Option<VideoMetrics>> {
        self.check_available()?;
        Ok(self.state.read().video_metrics.get(&post_id).cloned())
    }
}

#[async_trait]
impl AttractivenessStore for MemoryStore {
    async fn post_created_at(&self, post_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        self.check_available()?;
        Ok(self.state.read().posts.get(&post_id).copied())
    }

    async fn upsert_score(&self, score: &PostAttractivenessScore) -> Result<()> {
        self.check_available()?;
        self.state.write().scores.insert(score.post_id, score.clone());
        Ok(())
    }

    async fn get_score(&self, post_id: Uuid) -> Result<Option<PostAttractivenessScore>> {
        self.check_available()?;
        Ok(self.state.read().scores.get(&post_id).cloned())
    }
}

#[async_trait]
impl SocialGraph for MemoryStore {
    async fn following(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .follows
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn followees_of_followees(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<(Uuid, u32)>> {
        self.check_available()?;
        let state = self.state.read();
        let mut counts: HashMap<Uuid, u32> = HashMap::new();
        if let Some(followees) = state.follows.get(&user_id) {
            for followee in followees {
                if let Some(second) = state.follows.get(followee) {
                    for candidate in second {
                        if *candidate != user_id && !followees.contains(candidate) {
                            *counts.entry(*candidate).or_default() += 1;
                        }
                    }
                }
            }
        }
        let mut result: Vec<(Uuid, u32)> = counts.into_iter().collect();
        result.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        result.truncate(limit);
        Ok(result)
    }
}

#[async_trait]
impl SuggestionStore for MemoryStore {
    async fn replace_suggestions(
        &self,
        user_id: Uuid,
        suggestions: &[FollowSuggestion],
    ) -> Result<()> {
        self.check_available()?;
        self.state
            .write()
            .suggestions
            .insert(user_id, suggestions.to_vec());
        Ok(())
    }

    async fn get_suggestions(&self, user_id: Uuid) -> Result<Vec<FollowSuggestion>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .suggestions
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl RelationStore for MemoryStore {
    async fn get_relation(&self, relation_id: Uuid) -> Result<Option<BestFriendRelation>> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state
            .relations
            .values()
            .find(|r| r.id == relation_id)
            .or_else(|| state.relation_history.get(&relation_id))
            .cloned())
    }

    async fn get_relation_by_pair(&self, pair: PairKey) -> Result<Option<BestFriendRelation>> {
        self.check_available()?;
        Ok(self.state.read().relations.get(&pair).cloned())
    }

    async fn save_relation(&self, relation: &BestFriendRelation) -> Result<()> {
        self.check_available()?;
        Self::write_relation(&mut self.state.write(), relation)
    }

    async fn save_relation_with_interaction(
        &self,
        relation: &BestFriendRelation,
        interaction: &PairwiseInteraction,
    ) -> Result<()> {
        self.check_available()?;
        if self.faults.read().interaction_writes {
            return Err(EngagementError::store("interaction write failed"));
        }
        let mut state = self.state.write();
        Self::write_relation(&mut state, relation)?;
        state.pairwise.push(interaction.clone());
        Ok(())
    }

    async fn idle_relations(&self, before: DateTime<Utc>) -> Result<Vec<BestFriendRelation>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .relations
            .values()
            .filter(|r| {
                matches!(r.status, RelationStatus::Pending | RelationStatus::Active)
                    && r.last_interaction < before
            })
            .cloned()
            .collect())
    }

    async fn insert_permission_request(&self, request: &PermissionRequest) -> Result<()> {
        self.check_available()?;
        self.state
            .write()
            .requests
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn get_permission_request(&self, request_id: Uuid) -> Result<Option<PermissionRequest>> {
        self.check_available()?;
        Ok(self.state.read().requests.get(&request_id).cloned())
    }

    async fn update_permission_request(
        &self,
        request: &PermissionRequest,
        expected: PermissionStatus,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write();
        match state.requests.get_mut(&request.id) {
            Some(current) if current.status == expected => {
                *current = request.clone();
                Ok(())
            }
            Some(current) => Err(EngagementError::Conflict(format!(
                "permission request {} is {}, expected {}",
                request.id,
                current.status.as_str(),
                expected.as_str()
            ))),
            None => Err(EngagementError::not_found(format!(
                "permission request {}",
                request.id
            ))),
        }
    }

    async fn count_permission_requests(
        &self,
        relation_id: Uuid,
        action: PermissionAction,
        quota_period: DateTime<Utc>,
        statuses: &[PermissionStatus],
    ) -> Result<u32> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .requests
            .values()
            .filter(|r| {
                r.relation_id == relation_id
                    && r.action == action
                    && r.quota_period == quota_period
                    && statuses.contains(&r.status)
            })
            .count() as u32)
    }

    async fn stale_permission_requests(
        &self,
        requested_before: DateTime<Utc>,
        period_before: DateTime<Utc>,
    ) -> Result<Vec<PermissionRequest>> {
        self.check_available()?;
        let mut stale: Vec<PermissionRequest> = self
            .state
            .read()
            .requests
            .values()
            .filter(|r| {
                r.status == PermissionStatus::Requested
                    && (r.requested_at < requested_before || r.quota_period < period_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.requested_at);
        Ok(stale)
    }
}

#[async_trait]
impl RunRecordStore for MemoryStore {
    async fn insert_run(&self, record: &JobRunRecord) -> Result<()> {
        self.check_available()?;
        self.state.write().runs.push(record.clone());
        Ok(())
    }

    async fn latest_runs(&self) -> Result<Vec<JobRunRecord>> {
        self.check_available()?;
        let state = self.state.read();
        let mut latest: BTreeMap<Subsystem, &JobRunRecord> = BTreeMap::new();
        for run in &state.runs {
            match latest.get(&run.subsystem) {
                Some(existing) if existing.finished_at > run.finished_at => {}
                _ => {
                    latest.insert(run.subsystem, run);
                }
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn recent_runs(&self, subsystem: Subsystem, limit: usize) -> Result<Vec<JobRunRecord>> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| r.subsystem == subsystem)
            .take(limit)
            .cloned()
            .collect())
    }
}
