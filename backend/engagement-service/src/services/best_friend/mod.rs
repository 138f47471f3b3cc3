//! Best-friend relationship engine
//!
//! A relation tracks one unordered user pair through
//! `PENDING -> ACTIVE -> {PAUSED, ENDED}` and `PAUSED -> {ACTIVE, ENDED}`.
//! Point updates for a pair are serialised twice: by an in-process async
//! mutex per pair and by the optimistic `version` check in the store, so
//! concurrent instances retry instead of losing points. The relation row
//! and its pairwise log entry are written together or not at all.

mod points;
mod privileges;

pub use points::{interaction_points, validate_metadata};
pub use privileges::{
    badges_unlocked, privileges_for, quota_period_start, tier_for, tier_threshold,
};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use resilience::RetryConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{fan_out, with_store_retry, BatchReport};
use crate::clock::{days_between, Clock};
use crate::config::RelationshipConfig;
use crate::error::{EngagementError, Result};
use crate::models::{
    BestFriendRelation, InteractionMetadata, InteractionOutcome, InteractionType, PairKey,
    PairwiseInteraction, PermissionAction, PermissionRequest, PermissionStatus, Privileges,
    QuotaUsage, RelationRef, RelationStats, RelationStatus, RelationshipTier, Subsystem,
};
use crate::repository::{EventStore, RelationStore};

/// Statuses that consume quota
const COUNTED_STATUSES: [PermissionStatus; 2] =
    [PermissionStatus::Approved, PermissionStatus::Requested];

struct AppliedInteraction {
    relation: BestFriendRelation,
    previous_tier: RelationshipTier,
    points: i64,
}

pub struct BestFriendEngine {
    relations: Arc<dyn RelationStore>,
    events: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    config: RelationshipConfig,
    retry: RetryConfig,
    conflict_retry: RetryConfig,
    pair_locks: DashMap<PairKey, Arc<Mutex<()>>>,
}

impl BestFriendEngine {
    pub fn new(
        relations: Arc<dyn RelationStore>,
        events: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        config: RelationshipConfig,
        retry: RetryConfig,
    ) -> Self {
        let conflict_retry = RetryConfig {
            max_retries: config.max_conflict_retries,
            initial_backoff: std::time::Duration::from_millis(5),
            max_backoff: std::time::Duration::from_millis(200),
            backoff_multiplier: 2.0,
            jitter: true,
        };
        Self {
            relations,
            events,
            clock,
            config,
            retry,
            conflict_retry,
            pair_locks: DashMap::new(),
        }
    }

    fn pair_lock(&self, pair: PairKey) -> Arc<Mutex<()>> {
        self.pair_locks
            .entry(pair)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, relation_id: Uuid) -> Result<BestFriendRelation> {
        with_store_retry(&self.retry, || self.relations.get_relation(relation_id))
            .await?
            .ok_or_else(|| EngagementError::not_found(format!("relation {}", relation_id)))
    }

    async fn resolve(&self, reference: RelationRef) -> Result<BestFriendRelation> {
        match reference {
            RelationRef::Id(relation_id) => self.load(relation_id).await,
            RelationRef::Pair(a, b) => {
                let pair = PairKey::new(a, b)?;
                with_store_retry(&self.retry, || self.relations.get_relation_by_pair(pair))
                    .await?
                    .ok_or_else(|| EngagementError::not_found(format!("relation {}", pair)))
            }
        }
    }

    fn is_idle(&self, relation: &BestFriendRelation, now: DateTime<Utc>) -> bool {
        matches!(
            relation.status,
            RelationStatus::Pending | RelationStatus::Active
        ) && now - relation.last_interaction > Duration::days(self.config.inactivity_limit_days)
    }

    /// Fresh PENDING incarnation replacing an ENDED one under the same pair
    fn reopen(ended: &BestFriendRelation, now: DateTime<Utc>) -> BestFriendRelation {
        let mut fresh = BestFriendRelation::new(ended.pair(), now);
        fresh.version = ended.version;
        fresh
    }

    /// The relation an interaction applies to, ending an idle one first
    async fn current_incarnation(
        &self,
        pair: PairKey,
        now: DateTime<Utc>,
    ) -> Result<BestFriendRelation> {
        match self.relations.get_relation_by_pair(pair).await? {
            None => Ok(BestFriendRelation::new(pair, now)),
            Some(existing) if existing.status == RelationStatus::Ended => {
                Ok(Self::reopen(&existing, now))
            }
            Some(mut existing) if self.is_idle(&existing, now) => {
                existing.status = RelationStatus::Ended;
                existing.end_date = Some(now);
                existing.version += 1;
                self.relations.save_relation(&existing).await?;
                info!(
                    relation_id = %existing.id,
                    pair = %pair,
                    "Relation ended after inactivity"
                );
                Ok(Self::reopen(&existing, now))
            }
            Some(existing) => Ok(existing),
        }
    }

    /// Whether both directions reach the activation threshold since `since`,
    /// counting the interaction being applied for `actor_id`
    async fn mutual_threshold_met(
        &self,
        relation: &BestFriendRelation,
        actor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let mut from_user1 = self
            .events
            .count_pairwise(relation.id, relation.user1_id, since)
            .await?;
        let mut from_user2 = self
            .events
            .count_pairwise(relation.id, relation.user2_id, since)
            .await?;
        if actor_id == relation.user1_id {
            from_user1 += 1;
        } else {
            from_user2 += 1;
        }
        Ok(from_user1.min(from_user2) >= self.config.activation_threshold)
    }

    async fn apply_interaction(
        &self,
        pair: PairKey,
        actor_id: Uuid,
        post_id: Uuid,
        kind: InteractionType,
        metadata: &InteractionMetadata,
    ) -> Result<AppliedInteraction> {
        let now = self.clock.now();
        let mut relation = self.current_incarnation(pair, now).await?;
        let previous_tier = relation.relationship_strength;
        let (side, target_id) = match (pair.side_of(actor_id), pair.other(actor_id)) {
            (Some(side), Some(target)) => (side, target),
            _ => {
                return Err(EngagementError::validation(format!(
                    "user {} is not part of {}",
                    actor_id, pair
                )))
            }
        };

        let points = if relation.status == RelationStatus::Paused {
            0
        } else {
            interaction_points(kind, metadata)
        };
        relation.add_points(side, points);
        relation.last_interaction = now;
        let age_days = days_between(relation.start_date, now);
        relation.relationship_strength =
            tier_for(relation.total_points, age_days, &self.config).max(previous_tier);

        match relation.status {
            RelationStatus::Pending => {
                let since = now - Duration::days(self.config.activation_window_days);
                if self.mutual_threshold_met(&relation, actor_id, since).await? {
                    relation.status = RelationStatus::Active;
                    info!(relation_id = %relation.id, pair = %pair, "Relation activated");
                }
            }
            RelationStatus::Paused => {
                let since = relation.paused_at.unwrap_or(relation.start_date);
                if self.mutual_threshold_met(&relation, actor_id, since).await? {
                    relation.status = RelationStatus::Active;
                    relation.paused_at = None;
                    info!(relation_id = %relation.id, pair = %pair, "Relation resumed");
                }
            }
            RelationStatus::Active | RelationStatus::Ended => {}
        }

        relation.version += 1;
        let log_entry = PairwiseInteraction {
            relation_id: relation.id,
            actor_id,
            target_id,
            post_id,
            interaction_type: kind,
            points_awarded: points,
            occurred_at: now,
        };
        self.relations
            .save_relation_with_interaction(&relation, &log_entry)
            .await?;

        Ok(AppliedInteraction {
            relation,
            previous_tier,
            points,
        })
    }

    /// Credit `user_id` for interacting with a post by `post_author_id`
    pub async fn record_interaction(
        &self,
        user_id: Uuid,
        post_id: Uuid,
        post_author_id: Uuid,
        kind: InteractionType,
        metadata: &InteractionMetadata,
    ) -> Result<InteractionOutcome> {
        if user_id == post_author_id {
            debug!(user_id = %user_id, "Self interaction ignored");
            return Ok(InteractionOutcome::unchanged());
        }
        if post_id.is_nil() {
            return Err(EngagementError::validation("post_id must not be nil"));
        }
        validate_metadata(metadata)?;
        let pair = PairKey::new(user_id, post_author_id)?;

        let lock = self.pair_lock(pair);
        let _guard = lock.lock().await;

        let applied = with_store_retry(&self.conflict_retry, || {
            self.apply_interaction(pair, user_id, post_id, kind, metadata)
        })
        .await?;

        let tier = applied.relation.relationship_strength;
        let newly_unlocked_badges = badges_unlocked(applied.previous_tier, tier);
        if !newly_unlocked_badges.is_empty() {
            info!(
                relation_id = %applied.relation.id,
                tier = tier.as_str(),
                badges = ?newly_unlocked_badges,
                "Relationship tier raised"
            );
        }

        Ok(InteractionOutcome {
            points_awarded: applied.points,
            relation_updated: true,
            newly_unlocked_badges,
            relation: Some(applied.relation),
        })
    }

    /// Load, mutate and save one relation under its pair lock
    async fn update_relation<F>(&self, relation_id: Uuid, mutate: F) -> Result<BestFriendRelation>
    where
        F: Fn(&mut BestFriendRelation, DateTime<Utc>) -> Result<()>,
    {
        let pair = self.load(relation_id).await?.pair();
        let lock = self.pair_lock(pair);
        let _guard = lock.lock().await;

        let mutate = &mutate;
        with_store_retry(&self.conflict_retry, move || async move {
            let mut relation = self.load(relation_id).await?;
            mutate(&mut relation, self.clock.now())?;
            relation.version += 1;
            self.relations.save_relation(&relation).await?;
            Ok(relation)
        })
        .await
    }

    /// Moderation signal: ACTIVE -> PAUSED
    pub async fn pause_relation(&self, relation_id: Uuid) -> Result<BestFriendRelation> {
        let relation = self
            .update_relation(relation_id, |relation, now| {
                if relation.status != RelationStatus::Active {
                    return Err(EngagementError::invalid_state(format!(
                        "cannot pause a {} relation",
                        relation.status.as_str()
                    )));
                }
                relation.status = RelationStatus::Paused;
                relation.paused_at = Some(now);
                Ok(())
            })
            .await?;
        info!(relation_id = %relation_id, "Relation paused");
        Ok(relation)
    }

    /// Either member may end a relation in any state but ENDED
    pub async fn terminate_relation(
        &self,
        relation_id: Uuid,
        user_id: Uuid,
    ) -> Result<BestFriendRelation> {
        let relation = self
            .update_relation(relation_id, |relation, now| {
                if !relation.is_member(user_id) {
                    return Err(EngagementError::validation(format!(
                        "user {} is not a member of relation {}",
                        user_id, relation.id
                    )));
                }
                if relation.status == RelationStatus::Ended {
                    return Err(EngagementError::invalid_state("relation already ended"));
                }
                relation.status = RelationStatus::Ended;
                relation.end_date = Some(now);
                relation.paused_at = None;
                Ok(())
            })
            .await?;
        info!(relation_id = %relation_id, user_id = %user_id, "Relation terminated");
        Ok(relation)
    }

    pub async fn request_permission(
        &self,
        relation_id: Uuid,
        requester_id: Uuid,
        action: PermissionAction,
    ) -> Result<PermissionRequest> {
        let relation = self.load(relation_id).await?;
        if !relation.is_member(requester_id) {
            return Err(EngagementError::validation(format!(
                "user {} is not a member of relation {}",
                requester_id, relation_id
            )));
        }
        if relation.status != RelationStatus::Active {
            return Err(EngagementError::invalid_state(format!(
                "permissions need an ACTIVE relation, relation is {}",
                relation.status.as_str()
            )));
        }

        // quota check and insert must not interleave for the same pair
        let lock = self.pair_lock(relation.pair());
        let _guard = lock.lock().await;

        let now = self.clock.now();
        let period = quota_period_start(now, self.config.quota_period_days);
        let allowance = privileges_for(relation.relationship_strength).allowance(action);
        let used = with_store_retry(&self.retry, || {
            self.relations
                .count_permission_requests(relation_id, action, period, &COUNTED_STATUSES)
        })
        .await?;

        if used >= allowance {
            debug!(
                relation_id = %relation_id,
                action = action.as_str(),
                used,
                allowance,
                "Permission quota exhausted"
            );
            return Err(EngagementError::QuotaExceeded {
                action: action.as_str().to_string(),
                used,
                allowance,
            });
        }

        let request = PermissionRequest {
            id: Uuid::new_v4(),
            relation_id,
            requester_id,
            action,
            status: PermissionStatus::Requested,
            requested_at: now,
            resolved_at: None,
            resolved_by: None,
            quota_period: period,
        };
        with_store_retry(&self.retry, || self.relations.insert_permission_request(&request))
            .await?;

        info!(
            request_id = %request.id,
            relation_id = %relation_id,
            action = action.as_str(),
            "Permission requested"
        );
        Ok(request)
    }

    fn is_expired(&self, request: &PermissionRequest, now: DateTime<Utc>) -> bool {
        request.quota_period != quota_period_start(now, self.config.quota_period_days)
            || now - request.requested_at > Duration::hours(self.config.request_ttl_hours)
    }

    async fn resolve_request(
        &self,
        request_id: Uuid,
        responder_id: Uuid,
        approve: bool,
    ) -> Result<PermissionRequest> {
        let mut request = self
            .relations
            .get_permission_request(request_id)
            .await?
            .ok_or_else(|| EngagementError::not_found(format!("permission request {}", request_id)))?;
        if request.status != PermissionStatus::Requested {
            return Err(EngagementError::invalid_state(format!(
                "permission request {} is already {}",
                request_id,
                request.status.as_str()
            )));
        }

        let relation = self.load(request.relation_id).await?;
        if !relation.is_member(responder_id) || responder_id == request.requester_id {
            return Err(EngagementError::validation(
                "only the other member of the relation may respond",
            ));
        }

        let now = self.clock.now();
        if self.is_expired(&request, now) {
            request.status = PermissionStatus::Expired;
            request.resolved_at = Some(now);
            self.relations
                .update_permission_request(&request, PermissionStatus::Requested)
                .await?;
            return Err(EngagementError::invalid_state(format!(
                "permission request {} has expired",
                request_id
            )));
        }

        request.status = if approve {
            PermissionStatus::Approved
        } else {
            PermissionStatus::Denied
        };
        request.resolved_at = Some(now);
        request.resolved_by = Some(responder_id);
        self.relations
            .update_permission_request(&request, PermissionStatus::Requested)
            .await?;

        info!(
            request_id = %request_id,
            status = request.status.as_str(),
            "Permission request resolved"
        );
        Ok(request)
    }

    /// REQUESTED -> APPROVED | DENIED. A concurrent resolution makes the
    /// retry re-read the request and fail with `InvalidState`.
    pub async fn respond_to_permission_request(
        &self,
        request_id: Uuid,
        responder_id: Uuid,
        approve: bool,
    ) -> Result<PermissionRequest> {
        with_store_retry(&self.retry, || {
            self.resolve_request(request_id, responder_id, approve)
        })
        .await
    }

    pub async fn get_privileges(&self, relation_id: Uuid) -> Result<Privileges> {
        let relation = self.load(relation_id).await?;
        Ok(privileges_for(relation.relationship_strength))
    }

    pub async fn get_relation_stats(&self, reference: RelationRef) -> Result<RelationStats> {
        let relation = self.resolve(reference).await?;
        let now = self.clock.now();
        let tier = relation.relationship_strength;
        let privileges = privileges_for(tier);
        let next_tier = tier.next();
        let points_to_next_tier = next_tier
            .map(|next| (tier_threshold(next, &self.config) - relation.total_points).max(0));

        let period = quota_period_start(now, self.config.quota_period_days);
        let mut quota = Vec::with_capacity(PermissionAction::ALL.len());
        for action in PermissionAction::ALL {
            let used = with_store_retry(&self.retry, || {
                self.relations
                    .count_permission_requests(relation.id, action, period, &COUNTED_STATUSES)
            })
            .await?;
            let allowance = privileges.allowance(action);
            quota.push(QuotaUsage {
                action,
                allowance,
                used,
                remaining: allowance.saturating_sub(used),
            });
        }

        Ok(RelationStats {
            relation_id: relation.id,
            user1_id: relation.user1_id,
            user2_id: relation.user2_id,
            status: relation.status,
            tier,
            user1_points: relation.user1_points,
            user2_points: relation.user2_points,
            total_points: relation.total_points,
            age_days: days_between(relation.start_date, now),
            days_since_last_interaction: days_between(relation.last_interaction, now),
            next_tier,
            points_to_next_tier,
            privileges,
            quota,
        })
    }

    async fn end_if_idle(&self, relation_id: Uuid) -> Result<bool> {
        let pair = self.load(relation_id).await?.pair();
        let lock = self.pair_lock(pair);
        let _guard = lock.lock().await;

        let mut relation = self.load(relation_id).await?;
        let now = self.clock.now();
        if !self.is_idle(&relation, now) {
            return Ok(false);
        }
        relation.status = RelationStatus::Ended;
        relation.end_date = Some(now);
        relation.version += 1;
        self.relations.save_relation(&relation).await?;
        debug!(relation_id = %relation_id, "Idle relation ended");
        Ok(true)
    }

    async fn expire_request(&self, request_id: Uuid) -> Result<()> {
        let Some(mut request) = self.relations.get_permission_request(request_id).await? else {
            return Ok(());
        };
        if request.status != PermissionStatus::Requested {
            return Ok(());
        }
        request.status = PermissionStatus::Expired;
        request.resolved_at = Some(self.clock.now());
        match self
            .relations
            .update_permission_request(&request, PermissionStatus::Requested)
            .await
        {
            // resolved concurrently
            Err(EngagementError::Conflict(_)) => Ok(()),
            other => other,
        }
    }

    /// End idle relations and expire stale permission requests
    pub async fn run_maintenance(&self) -> Result<BatchReport> {
        let start = Instant::now();
        let now = self.clock.now();

        let idle_before = now - Duration::days(self.config.inactivity_limit_days);
        let idle: Vec<Uuid> = self
            .relations
            .idle_relations(idle_before)
            .await?
            .into_iter()
            .map(|relation| relation.id)
            .collect();
        let idle_count = idle.len();
        let ended = fan_out(
            Subsystem::RelationshipMaintenance,
            idle,
            self.config.worker_concurrency,
            |relation_id| self.end_if_idle(relation_id),
        )
        .await;

        let stale: Vec<Uuid> = self
            .relations
            .stale_permission_requests(
                now - Duration::hours(self.config.request_ttl_hours),
                quota_period_start(now, self.config.quota_period_days),
            )
            .await?
            .into_iter()
            .map(|request| request.id)
            .collect();
        let stale_count = stale.len();
        let expired = fan_out(
            Subsystem::RelationshipMaintenance,
            stale,
            self.config.worker_concurrency,
            |request_id| self.expire_request(request_id),
        )
        .await;

        self.pair_locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        let report = ended.merge(expired);
        if report.failed > 0 {
            warn!(failed = report.failed, "Relationship maintenance had failures");
        }
        info!(
            idle_relations = idle_count,
            stale_requests = stale_count,
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Relationship maintenance completed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::Badge;
    use crate::repository::MemoryStore;
    use chrono::TimeZone;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        engine: BestFriendEngine,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 2, 14, 0, 0).unwrap(),
        ));
        let engine = BestFriendEngine::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            RelationshipConfig::default(),
            RetryConfig::disabled(),
        );
        Harness {
            store,
            clock,
            engine,
        }
    }

    async fn interact(h: &Harness, actor: Uuid, author: Uuid, kind: InteractionType) -> InteractionOutcome {
        h.engine
            .record_interaction(actor, Uuid::new_v4(), author, kind, &InteractionMetadata::default())
            .await
            .unwrap()
    }

    async fn active_relation(h: &Harness, a: Uuid, b: Uuid) -> BestFriendRelation {
        let mut last = None;
        for _ in 0..3 {
            interact(h, a, b, InteractionType::Like).await;
            last = interact(h, b, a, InteractionType::Like).await.relation;
        }
        let relation = last.unwrap();
        assert_eq!(relation.status, RelationStatus::Active);
        relation
    }

    #[tokio::test]
    async fn test_self_interaction_is_a_no_op() {
        let h = harness();
        let me = Uuid::new_v4();
        let outcome = interact(&h, me, me, InteractionType::Share).await;
        assert_eq!(outcome.points_awarded, 0);
        assert!(!outcome.relation_updated);
        assert!(outcome.relation.is_none());
    }

    #[tokio::test]
    async fn test_points_go_to_actor_side() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        interact(&h, a, b, InteractionType::Comment).await;
        let relation = interact(&h, b, a, InteractionType::Like).await.relation.unwrap();
        let pair = PairKey::new(a, b).unwrap();
        let (a_points, b_points) = if pair.user1_id == a {
            (relation.user1_points, relation.user2_points)
        } else {
            (relation.user2_points, relation.user1_points)
        };
        assert_eq!((a_points, b_points), (5, 2));
        assert_eq!(relation.total_points, 7);
        assert_eq!(relation.status, RelationStatus::Pending);
        assert_eq!(relation.version, 2);
    }

    #[tokio::test]
    async fn test_mutual_interactions_activate() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for _ in 0..5 {
            let outcome = interact(&h, a, b, InteractionType::Like).await;
            assert_eq!(outcome.relation.unwrap().status, RelationStatus::Pending);
        }
        active_relation(&h, a, b).await;
    }

    #[tokio::test]
    async fn test_strong_badge_unlocks_exactly_once() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut unlocked = Vec::new();
        for _ in 0..30 {
            let outcome = interact(&h, a, b, InteractionType::Share).await;
            unlocked.extend(outcome.newly_unlocked_badges);
        }
        assert_eq!(unlocked, vec![Badge::RisingFriend, Badge::CloseFriend]);
        let relation = h
            .store
            .get_relation_by_pair(PairKey::new(a, b).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relation.relationship_strength, RelationshipTier::Strong);
    }

    #[tokio::test]
    async fn test_concurrent_interactions_keep_total() {
        let h = Arc::new(harness());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let h = h.clone();
                tokio::spawn(async move {
                    let (actor, author) = if i % 2 == 0 { (a, b) } else { (b, a) };
                    interact(&h, actor, author, InteractionType::Like).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        let relation = h
            .store
            .get_relation_by_pair(PairKey::new(a, b).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relation.total_points, 40);
        assert_eq!(relation.user1_points, 20);
        assert_eq!(relation.user2_points, 20);
        assert_eq!(relation.version, 20);
    }

    #[tokio::test]
    async fn test_paused_relation_withholds_points_until_mutual_again() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let relation = active_relation(&h, a, b).await;
        h.clock.advance(Duration::minutes(1));
        h.engine.pause_relation(relation.id).await.unwrap();

        let outcome = interact(&h, a, b, InteractionType::Share).await;
        assert_eq!(outcome.points_awarded, 0);
        assert_eq!(outcome.relation.unwrap().status, RelationStatus::Paused);

        for _ in 0..2 {
            interact(&h, a, b, InteractionType::Like).await;
        }
        let mut status = RelationStatus::Paused;
        for _ in 0..3 {
            status = interact(&h, b, a, InteractionType::Like)
                .await
                .relation
                .unwrap()
                .status;
        }
        assert_eq!(status, RelationStatus::Active);
        assert_eq!(
            interact(&h, a, b, InteractionType::Like).await.points_awarded,
            2
        );
    }

    #[tokio::test]
    async fn test_pause_requires_active() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let relation = interact(&h, a, b, InteractionType::Like).await.relation.unwrap();
        let err = h.engine.pause_relation(relation.id).await.unwrap_err();
        assert!(matches!(err, EngagementError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_terminated_relation_reopens_fresh() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let relation = active_relation(&h, a, b).await;

        let outsider = Uuid::new_v4();
        assert!(matches!(
            h.engine.terminate_relation(relation.id, outsider).await,
            Err(EngagementError::Validation(_))
        ));
        let ended = h.engine.terminate_relation(relation.id, b).await.unwrap();
        assert_eq!(ended.status, RelationStatus::Ended);
        assert!(matches!(
            h.engine.terminate_relation(relation.id, a).await,
            Err(EngagementError::InvalidState(_))
        ));

        let reopened = interact(&h, a, b, InteractionType::Like).await.relation.unwrap();
        assert_ne!(reopened.id, relation.id);
        assert_eq!(reopened.status, RelationStatus::Pending);
        assert_eq!(reopened.total_points, 2);

        // the ended incarnation stays readable by id
        let history = h.store.get_relation(relation.id).await.unwrap().unwrap();
        assert_eq!(history.status, RelationStatus::Ended);
        assert_eq!(history.total_points, ended.total_points);
        let stats = h
            .engine
            .get_relation_stats(RelationRef::Id(relation.id))
            .await
            .unwrap();
        assert_eq!(stats.status, RelationStatus::Ended);
    }

    #[tokio::test]
    async fn test_failed_write_awards_no_points() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let first = interact(&h, a, b, InteractionType::Like).await.relation.unwrap();

        h.store.fail_interaction_writes(true);
        let err = h
            .engine
            .record_interaction(
                a,
                Uuid::new_v4(),
                b,
                InteractionType::Share,
                &InteractionMetadata::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngagementError::TransientStore(_)));

        let stored = h.store.get_relation(first.id).await.unwrap().unwrap();
        assert_eq!(stored.total_points, 2);
        assert_eq!(stored.version, first.version);
        let since = first.start_date - Duration::days(1);
        assert_eq!(h.store.count_pairwise(first.id, a, since).await.unwrap(), 1);

        // a retry by the caller is credited once
        h.store.fail_interaction_writes(false);
        let retried = interact(&h, a, b, InteractionType::Share).await.relation.unwrap();
        assert_eq!(retried.total_points, 10);
        assert_eq!(h.store.count_pairwise(first.id, a, since).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_inactivity_ends_lazily_and_in_maintenance() {
        let h = harness();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let first = active_relation(&h, a, b).await;
        let other = interact(&h, a, c, InteractionType::Like).await.relation.unwrap();

        h.clock.advance(Duration::days(31));

        let reopened = interact(&h, b, a, InteractionType::Like).await.relation.unwrap();
        assert_ne!(reopened.id, first.id);
        assert_eq!(reopened.total_points, 2);

        let report = h.engine.run_maintenance().await.unwrap();
        assert_eq!(report.succeeded, 1);
        let ended = h.store.get_relation(other.id).await.unwrap().unwrap();
        assert_eq!(ended.status, RelationStatus::Ended);
    }

    #[tokio::test]
    async fn test_permission_quota() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let relation = active_relation(&h, a, b).await;

        // NEW tier has no extra posts
        assert!(matches!(
            h.engine
                .request_permission(relation.id, a, PermissionAction::ExtraPost)
                .await,
            Err(EngagementError::QuotaExceeded { allowance: 0, .. })
        ));

        for _ in 0..25 {
            interact(&h, a, b, InteractionType::Share).await;
        }
        assert_eq!(
            h.engine.get_privileges(relation.id).await.unwrap().tier,
            RelationshipTier::Strong
        );

        let request = h
            .engine
            .request_permission(relation.id, a, PermissionAction::ExtraPost)
            .await
            .unwrap();
        assert_eq!(request.status, PermissionStatus::Requested);
        assert!(matches!(
            h.engine
                .request_permission(relation.id, b, PermissionAction::ExtraPost)
                .await,
            Err(EngagementError::QuotaExceeded { used: 1, allowance: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_request_needs_active_member() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let pending = interact(&h, a, b, InteractionType::Like).await.relation.unwrap();
        assert!(matches!(
            h.engine
                .request_permission(pending.id, a, PermissionAction::ExtraComment)
                .await,
            Err(EngagementError::InvalidState(_))
        ));
        assert!(matches!(
            h.engine
                .request_permission(pending.id, Uuid::new_v4(), PermissionAction::ExtraComment)
                .await,
            Err(EngagementError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_respond_workflow() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let relation = active_relation(&h, a, b).await;
        for _ in 0..7 {
            interact(&h, b, a, InteractionType::Share).await;
        }
        let request = h
            .engine
            .request_permission(relation.id, a, PermissionAction::ExtraComment)
            .await
            .unwrap();

        assert!(matches!(
            h.engine.respond_to_permission_request(request.id, a, true).await,
            Err(EngagementError::Validation(_))
        ));
        let approved = h
            .engine
            .respond_to_permission_request(request.id, b, true)
            .await
            .unwrap();
        assert_eq!(approved.status, PermissionStatus::Approved);
        assert_eq!(approved.resolved_by, Some(b));
        assert!(matches!(
            h.engine.respond_to_permission_request(request.id, b, false).await,
            Err(EngagementError::InvalidState(_))
        ));

        let stats = h
            .engine
            .get_relation_stats(RelationRef::Pair(b, a))
            .await
            .unwrap();
        let comments = stats
            .quota
            .iter()
            .find(|q| q.action == PermissionAction::ExtraComment)
            .unwrap();
        assert_eq!((comments.allowance, comments.used, comments.remaining), (3, 1, 2));
    }

    #[tokio::test]
    async fn test_stale_request_expires_on_touch() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let relation = active_relation(&h, a, b).await;
        for _ in 0..7 {
            interact(&h, a, b, InteractionType::Share).await;
        }
        let request = h
            .engine
            .request_permission(relation.id, a, PermissionAction::ExtraComment)
            .await
            .unwrap();

        h.clock.advance(Duration::days(8));
        assert!(matches!(
            h.engine.respond_to_permission_request(request.id, b, true).await,
            Err(EngagementError::InvalidState(_))
        ));
        let stored = h.store.get_permission_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PermissionStatus::Expired);
    }

    #[tokio::test]
    async fn test_relation_stats() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let relation = active_relation(&h, a, b).await;
        h.clock.advance(Duration::days(2));

        let stats = h
            .engine
            .get_relation_stats(RelationRef::Id(relation.id))
            .await
            .unwrap();
        assert_eq!(stats.total_points, 12);
        assert_eq!(stats.tier, RelationshipTier::New);
        assert_eq!(stats.next_tier, Some(RelationshipTier::Growing));
        assert_eq!(stats.points_to_next_tier, Some(38));
        assert!((stats.days_since_last_interaction - 2.0).abs() < 1e-9);

        assert!(matches!(
            h.engine
                .get_relation_stats(RelationRef::Id(Uuid::new_v4()))
                .await,
            Err(EngagementError::NotFound(_))
        ));
    }
}
