//! Data-access interface, one trait per entity kind.
//!
//! Both [`MemoryStore`] (single process, tests) and [`PgStore`] (PostgreSQL)
//! implement every trait. Engines only ever see the traits.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    BestFriendRelation, ContentCluster, EngagementCounts, FollowSuggestion, InteractionEvent,
    InterestScore, JobRunRecord, PairKey, PairwiseInteraction, PermissionAction,
    PermissionRequest, PermissionStatus, PostAttractivenessScore, ScrollEvent, Subsystem,
    VideoMetrics, VideoWatchSession,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Append-only raw behaviour events
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_interaction(&self, event: &InteractionEvent) -> Result<()>;

    async fn append_scroll(&self, event: &ScrollEvent) -> Result<()>;

    /// A user's interaction events at or after `since`
    async fn interactions_for_user(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>>;

    /// Per-kind engagement counts of a post, over all time
    async fn engagement_counts(&self, post_id: Uuid) -> Result<EngagementCounts>;

    /// Posts with interaction events at or after `since`, most recent first
    async fn posts_engaged_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>>;

    /// Users with any event at or after `since`, with their latest activity.
    /// Users in `exclude` are dropped before `limit` applies.
    async fn recently_active_users(
        &self,
        since: DateTime<Utc>,
        exclude: &[Uuid],
        limit: usize,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>>;

    /// Latest activity of each listed user that has any
    async fn last_active_at(&self, user_ids: &[Uuid]) -> Result<HashMap<Uuid, DateTime<Utc>>>;

    /// Pairwise interactions by `actor_id` within `relation_id` at or after `since`
    async fn count_pairwise(
        &self,
        relation_id: Uuid,
        actor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u32>;
}

#[async_trait]
pub trait InterestStore: Send + Sync {
    async fn get_interest(&self, user_id: Uuid, topic_id: &str) -> Result<Option<InterestScore>>;

    /// Atomically add `weight` to the raw score, creating the row if needed.
    /// Sets last_reinforced_at, marks for recalculation, revives archived rows,
    /// and resets decayed_score to the new raw score.
    async fn reinforce(
        &self,
        user_id: Uuid,
        topic_id: &str,
        weight: f64,
        now: DateTime<Utc>,
    ) -> Result<InterestScore>;

    /// Every score of the user, archived included
    async fn list_interests(&self, user_id: Uuid) -> Result<Vec<InterestScore>>;

    async fn users_with_interests(&self) -> Result<Vec<Uuid>>;

    /// Write decay results for one user in one atomic step. Rows reinforced
    /// since they were read (last_reinforced_at differs) are left untouched.
    async fn apply_decay(
        &self,
        user_id: Uuid,
        updates: &[InterestScore],
        deletions: &[InterestScore],
    ) -> Result<()>;

    async fn replace_clusters(&self, user_id: Uuid, clusters: &[ContentCluster]) -> Result<()>;

    async fn list_clusters(&self, user_id: Uuid) -> Result<Vec<ContentCluster>>;

    /// Other users holding a non-archived score on any of `topics`, with the
    /// number of such topics. Users in `exclude` are dropped before `limit`.
    async fn users_sharing_topics(
        &self,
        user_id: Uuid,
        topics: &[String],
        exclude: &[Uuid],
        limit: usize,
    ) -> Result<Vec<(Uuid, u32)>>;
}

#[async_trait]
pub trait VideoStore: Send + Sync {
    /// Returns false when the (user, post, session) row already exists
    async fn append_session(&self, session: &VideoWatchSession) -> Result<bool>;

    async fn sessions_for_post(&self, post_id: Uuid) -> Result<Vec<VideoWatchSession>>;

    /// Posts with sessions recorded at or after `since`, most recent first
    async fn posts_watched_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>>;

    async fn upsert_metrics(&self, metrics: &VideoMetrics) -> Result<()>;

    async fn get_metrics(&self, post_id: Uuid) -> Result<Option<VideoMetrics>>;
}

#[async_trait]
pub trait AttractivenessStore: Send + Sync {
    async fn post_created_at(&self, post_id: Uuid) -> Result<Option<DateTime<Utc>>>;

    async fn upsert_score(&self, score: &PostAttractivenessScore) -> Result<()>;

    async fn get_score(&self, post_id: Uuid) -> Result<Option<PostAttractivenessScore>>;
}

/// Read side of the follow graph
#[async_trait]
pub trait SocialGraph: Send + Sync {
    async fn following(&self, user_id: Uuid) -> Result<Vec<Uuid>>;

    /// Users followed by the user's followees, with how many followees follow
    /// each of them. Never the user or anyone the user already follows.
    async fn followees_of_followees(&self, user_id: Uuid, limit: usize)
        -> Result<Vec<(Uuid, u32)>>;
}

#[async_trait]
pub trait SuggestionStore: Send + Sync {
    async fn replace_suggestions(
        &self,
        user_id: Uuid,
        suggestions: &[FollowSuggestion],
    ) -> Result<()>;

    async fn get_suggestions(&self, user_id: Uuid) -> Result<Vec<FollowSuggestion>>;
}

#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Current relation with this id, or an ended incarnation kept in history
    async fn get_relation(&self, relation_id: Uuid) -> Result<Option<BestFriendRelation>>;

    async fn get_relation_by_pair(&self, pair: PairKey) -> Result<Option<BestFriendRelation>>;

    /// Persist `relation`, whose version must be exactly one above the stored
    /// row (version 1 inserts a new pair). Anything else is `Conflict`. When
    /// the write carries a new id for the pair, the replaced incarnation is
    /// kept in history.
    async fn save_relation(&self, relation: &BestFriendRelation) -> Result<()>;

    /// `save_relation` and the append of `interaction` as one atomic write
    async fn save_relation_with_interaction(
        &self,
        relation: &BestFriendRelation,
        interaction: &PairwiseInteraction,
    ) -> Result<()>;

    /// PENDING/ACTIVE relations whose last interaction is before `before`
    async fn idle_relations(&self, before: DateTime<Utc>) -> Result<Vec<BestFriendRelation>>;

    async fn insert_permission_request(&self, request: &PermissionRequest) -> Result<()>;

    async fn get_permission_request(&self, request_id: Uuid) -> Result<Option<PermissionRequest>>;

    /// Persist a resolved request if its stored status is still `expected`
    async fn update_permission_request(
        &self,
        request: &PermissionRequest,
        expected: PermissionStatus,
    ) -> Result<()>;

    async fn count_permission_requests(
        &self,
        relation_id: Uuid,
        action: PermissionAction,
        quota_period: DateTime<Utc>,
        statuses: &[PermissionStatus],
    ) -> Result<u32>;

    /// REQUESTED requests made before `requested_before` or belonging to a
    /// quota period that started before `period_before`
    async fn stale_permission_requests(
        &self,
        requested_before: DateTime<Utc>,
        period_before: DateTime<Utc>,
    ) -> Result<Vec<PermissionRequest>>;
}

#[async_trait]
pub trait RunRecordStore: Send + Sync {
    async fn insert_run(&self, record: &JobRunRecord) -> Result<()>;

    /// Most recent run per subsystem
    async fn latest_runs(&self) -> Result<Vec<JobRunRecord>>;

    async fn recent_runs(&self, subsystem: Subsystem, limit: usize) -> Result<Vec<JobRunRecord>>;
}

/// Handles to every store, shared by the engines
#[derive(Clone)]
pub struct Repositories {
    pub events: Arc<dyn EventStore>,
    pub interests: Arc<dyn InterestStore>,
    pub videos: Arc<dyn VideoStore>,
    pub attractiveness: Arc<dyn AttractivenessStore>,
    pub graph: Arc<dyn SocialGraph>,
    pub suggestions: Arc<dyn SuggestionStore>,
    pub relations: Arc<dyn RelationStore>,
    pub runs: Arc<dyn RunRecordStore>,
}

impl Repositories {
    /// Use one backend for every entity kind
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: EventStore
            + InterestStore
            + VideoStore
            + AttractivenessStore
            + SocialGraph
            + SuggestionStore
            + RelationStore
            + RunRecordStore
            + 'static,
    {
        Self {
            events: store.clone(),
            interests: store.clone(),
            videos: store.clone(),
            attractiveness: store.clone(),
            graph: store.clone(),
            suggestions: store.clone(),
            relations: store.clone(),
            runs: store,
        }
    }
}
