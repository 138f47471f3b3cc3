//! PostgreSQL store
//!
//! Enumerations are stored as TEXT and parsed back through the same closed
//! `FromStr` impls the intake path uses, so an unknown value in the database
//! surfaces as a validation error instead of a panic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    AttractivenessStore, EventStore, InterestStore, RelationStore, RunRecordStore, SocialGraph,
    SuggestionStore, VideoStore,
};
use crate::config::DatabaseConfig;
use crate::error::{EngagementError, Result};
use crate::models::{
    BestFriendRelation, ContentCluster, EngagementCounts, EngagementKind, FollowSuggestion,
    InteractionEvent, InterestScore, JobRunRecord, PairKey, PairwiseInteraction,
    PermissionAction, PermissionRequest, PermissionStatus, PostAttractivenessScore,
    ScrollEvent, Subsystem, VideoMetrics, VideoWatchSession,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| EngagementError::validation("database url is not configured"))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        debug!("Running engagement-service migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn count_to_u32(count: i64) -> u32 {
    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

// ============================================
// Row types
// ============================================

#[derive(sqlx::FromRow)]
struct InteractionRow {
    user_id: Uuid,
    post_id: Uuid,
    post_author_id: Uuid,
    kind: String,
    topics: Vec<String>,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<InteractionRow> for InteractionEvent {
    type Error = EngagementError;

    fn try_from(row: InteractionRow) -> Result<Self> {
        Ok(Self {
            user_id: row.user_id,
            post_id: row.post_id,
            post_author_id: row.post_author_id,
            kind: row.kind.parse()?,
            topics: row.topics,
            occurred_at: row.occurred_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InterestRow {
    user_id: Uuid,
    topic_id: String,
    raw_score: f64,
    decayed_score: f64,
    last_reinforced_at: DateTime<Utc>,
    needs_recalculation: bool,
    is_archived: bool,
    archived_at: Option<DateTime<Utc>>,
    reinforcement_count: i64,
    created_at: DateTime<Utc>,
}

impl From<InterestRow> for InterestScore {
    fn from(row: InterestRow) -> Self {
        Self {
            user_id: row.user_id,
            topic_id: row.topic_id,
            raw_score: row.raw_score,
            decayed_score: row.decayed_score,
            last_reinforced_at: row.last_reinforced_at,
            needs_recalculation: row.needs_recalculation,
            is_archived: row.is_archived,
            archived_at: row.archived_at,
            reinforcement_count: row.reinforcement_count,
            created_at: row.created_at,
        }
    }
}

const INTEREST_COLUMNS: &str = "user_id, topic_id, raw_score, decayed_score, last_reinforced_at, \
     needs_recalculation, is_archived, archived_at, reinforcement_count, created_at";

#[derive(sqlx::FromRow)]
struct ClusterRow {
    cluster_id: Uuid,
    user_id: Uuid,
    member_topic_ids: Vec<String>,
    centroid_score: f64,
    created_at: DateTime<Utc>,
}

impl From<ClusterRow> for ContentCluster {
    fn from(row: ClusterRow) -> Self {
        Self {
            cluster_id: row.cluster_id,
            user_id: row.user_id,
            member_topic_ids: row.member_topic_ids.into_iter().collect(),
            centroid_score: row.centroid_score,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    user_id: Uuid,
    post_id: Uuid,
    session_id: String,
    video_duration: f64,
    watched_duration: f64,
    watched_percentage: f64,
    play_count: i32,
    pause_count: i32,
    seek_count: i32,
    quality_changes: i32,
    volume_changes: i32,
    is_completed: bool,
    exit_point: f64,
    recorded_at: DateTime<Utc>,
}

impl From<SessionRow> for VideoWatchSession {
    fn from(row: SessionRow) -> Self {
        Self {
            user_id: row.user_id,
            post_id: row.post_id,
            session_id: row.session_id,
            video_duration: row.video_duration,
            watched_duration: row.watched_duration,
            watched_percentage: row.watched_percentage,
            play_count: row.play_count,
            pause_count: row.pause_count,
            seek_count: row.seek_count,
            quality_changes: row.quality_changes,
            volume_changes: row.volume_changes,
            is_completed: row.is_completed,
            exit_point: row.exit_point,
            recorded_at: row.recorded_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VideoMetricsRow {
    post_id: Uuid,
    total_views: i64,
    unique_viewers: i64,
    average_watch_time: f64,
    completion_rate: f64,
    retention_rate: f64,
    average_pause_count: f64,
    average_seek_count: f64,
    rewatch_rate: f64,
    average_exit_point: f64,
    updated_at: DateTime<Utc>,
}

impl From<VideoMetricsRow> for VideoMetrics {
    fn from(row: VideoMetricsRow) -> Self {
        Self {
            post_id: row.post_id,
            total_views: row.total_views,
            unique_viewers: row.unique_viewers,
            average_watch_time: row.average_watch_time,
            completion_rate: row.completion_rate,
            retention_rate: row.retention_rate,
            average_pause_count: row.average_pause_count,
            average_seek_count: row.average_seek_count,
            rewatch_rate: row.rewatch_rate,
            average_exit_point: row.average_exit_point,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttractivenessRow {
    post_id: Uuid,
    views: i64,
    likes: i64,
    comments: i64,
    shares: i64,
    saves: i64,
    profile_clicks: i64,
    hashtag_clicks: i64,
    raw_score: f64,
    normalized_score: f64,
    weights_version: i32,
    computed_at: DateTime<Utc>,
}

impl From<AttractivenessRow> for PostAttractivenessScore {
    fn from(row: AttractivenessRow) -> Self {
        Self {
            post_id: row.post_id,
            counts: EngagementCounts {
                views: row.views,
                likes: row.likes,
                comments: row.comments,
                shares: row.shares,
                saves: row.saves,
                profile_clicks: row.profile_clicks,
                hashtag_clicks: row.hashtag_clicks,
            },
            raw_score: row.raw_score,
            normalized_score: row.normalized_score,
            weights_version: row.weights_version,
            computed_at: row.computed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SuggestionRow {
    user_id: Uuid,
    candidate_id: Uuid,
    score: f64,
    interest_overlap: i32,
    mutual_follows: i32,
    recency: f64,
    reason: String,
    generated_at: DateTime<Utc>,
}

impl From<SuggestionRow> for FollowSuggestion {
    fn from(row: SuggestionRow) -> Self {
        Self {
            user_id: row.user_id,
            candidate_id: row.candidate_id,
            score: row.score,
            interest_overlap: row.interest_overlap.max(0) as u32,
            mutual_follows: row.mutual_follows.max(0) as u32,
            recency: row.recency,
            reason: row.reason,
            generated_at: row.generated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RelationRow {
    id: Uuid,
    user1_id: Uuid,
    user2_id: Uuid,
    status: String,
    user1_points: i64,
    user2_points: i64,
    total_points: i64,
    relationship_strength: String,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    last_interaction: DateTime<Utc>,
    paused_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<RelationRow> for BestFriendRelation {
    type Error = EngagementError;

    fn try_from(row: RelationRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user1_id: row.user1_id,
            user2_id: row.user2_id,
            status: row.status.parse()?,
            user1_points: row.user1_points,
            user2_points: row.user2_points,
            total_points: row.total_points,
            relationship_strength: row.relationship_strength.parse()?,
            start_date: row.start_date,
            end_date: row.end_date,
            last_interaction: row.last_interaction,
            paused_at: row.paused_at,
            version: row.version,
        })
    }
}

const RELATION_COLUMNS: &str = "id, user1_id, user2_id, status, user1_points, user2_points, \
     total_points, relationship_strength, start_date, end_date, last_interaction, paused_at, version";

/// Version-checked write of one relation row. A write that replaces an
/// ENDED incarnation with a fresh id first copies the old row to history.
async fn write_relation(conn: &mut PgConnection, relation: &BestFriendRelation) -> Result<()> {
    if relation.version > 1 {
        sqlx::query(&format!(
            r#"
            INSERT INTO best_friend_relation_history ({cols})
            SELECT {cols}
            FROM best_friend_relations
            WHERE user1_id = $1 AND user2_id = $2 AND version = $3 - 1 AND id <> $4
            ON CONFLICT (id) DO NOTHING
            "#,
            cols = RELATION_COLUMNS
        ))
        .bind(relation.user1_id)
        .bind(relation.user2_id)
        .bind(relation.version)
        .bind(relation.id)
        .execute(&mut *conn)
        .await?;
    }

    let result = if relation.version == 1 {
        sqlx::query(
            r#"
            INSERT INTO best_friend_relations
                (id, user1_id, user2_id, status, user1_points, user2_points, total_points,
                 relationship_strength, start_date, end_date, last_interaction, paused_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (user1_id, user2_id) DO NOTHING
            "#,
        )
    } else {
        sqlx::query(
            r#"
            UPDATE best_friend_relations
            SET id = $1,
                status = $4,
                user1_points = $5,
                user2_points = $6,
                total_points = $7,
                relationship_strength = $8,
                start_date = $9,
                end_date = $10,
                last_interaction = $11,
                paused_at = $12,
                version = $13
            WHERE user1_id = $2 AND user2_id = $3 AND version = $13 - 1
            "#,
        )
    }
    .bind(relation.id)
    .bind(relation.user1_id)
    .bind(relation.user2_id)
    .bind(relation.status.as_str())
    .bind(relation.user1_points)
    .bind(relation.user2_points)
    .bind(relation.total_points)
    .bind(relation.relationship_strength.as_str())
    .bind(relation.start_date)
    .bind(relation.end_date)
    .bind(relation.last_interaction)
    .bind(relation.paused_at)
    .bind(relation.version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngagementError::Conflict(format!(
            "relation {} changed before version {} could be written",
            relation.pair(),
            relation.version
        )));
    }
    Ok(())
}

async fn insert_pairwise(conn: &mut PgConnection, interaction: &PairwiseInteraction) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pairwise_interactions
            (relation_id, actor_id, target_id, post_id, interaction_type, points_awarded, occurred_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(interaction.relation_id)
    .bind(interaction.actor_id)
    .bind(interaction.target_id)
    .bind(interaction.post_id)
    .bind(interaction.interaction_type.as_str())
    .bind(interaction.points_awarded)
    .bind(interaction.occurred_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct PermissionRow {
    id: Uuid,
    relation_id: Uuid,
    requester_id: Uuid,
    action: String,
    status: String,
    requested_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<Uuid>,
    quota_period: DateTime<Utc>,
}

impl TryFrom<PermissionRow> for PermissionRequest {
    type Error = EngagementError;

    fn try_from(row: PermissionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            relation_id: row.relation_id,
            requester_id: row.requester_id,
            action: row.action.parse()?,
            status: row.status.parse()?,
            requested_at: row.requested_at,
            resolved_at: row.resolved_at,
            resolved_by: row.resolved_by,
            quota_period: row.quota_period,
        })
    }
}

const PERMISSION_COLUMNS: &str = "id, relation_id, requester_id, action, status, requested_at, \
     resolved_at, resolved_by, quota_period";

#[derive(sqlx::FromRow)]
struct RunRow {
    subsystem: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_ms: i64,
    items_processed: i64,
    items_failed: i64,
    error: Option<String>,
}

impl TryFrom<RunRow> for JobRunRecord {
    type Error = EngagementError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Self {
            subsystem: row.subsystem.parse()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration_ms: row.duration_ms,
            items_processed: row.items_processed,
            items_failed: row.items_failed,
            error: row.error,
        })
    }
}

// ============================================
// Store implementations
// ============================================

#[async_trait]
impl EventStore for PgStore {
    async fn append_interaction(&self, event: &InteractionEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO interaction_events (user_id, post_id, post_author_id, kind, topics, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.user_id)
        .bind(event.post_id)
        .bind(event.post_author_id)
        .bind(event.kind.as_str())
        .bind(&event.topics)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_scroll(&self, event: &ScrollEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scroll_events (user_id, post_id, scroll_depth, dwell_ms, topics, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.user_id)
        .bind(event.post_id)
        .bind(event.scroll_depth)
        .bind(i64::try_from(event.dwell_ms).unwrap_or(i64::MAX))
        .bind(&event.topics)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn interactions_for_user(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>> {
        let rows = sqlx::query_as::<_, InteractionRow>(
            r#"
            SELECT user_id, post_id, post_author_id, kind, topics, occurred_at
            FROM interaction_events
            WHERE user_id = $1 AND occurred_at >= $2
            ORDER BY occurred_at
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(InteractionEvent::try_from).collect()
    }

    async fn engagement_counts(&self, post_id: Uuid) -> Result<EngagementCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT kind, COUNT(*)
            FROM interaction_events
            WHERE post_id = $1
            GROUP BY kind
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = EngagementCounts::default();
        for (kind, n) in rows {
            counts.add(kind.parse::<EngagementKind>()?, n);
        }
        Ok(counts)
    }

    async fn posts_engaged_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let posts = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT post_id
            FROM interaction_events
            WHERE occurred_at >= $1
            GROUP BY post_id
            ORDER BY MAX(occurred_at) DESC, post_id
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    async fn recently_active_users(
        &self,
        since: DateTime<Utc>,
        exclude: &[Uuid],
        limit: usize,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let users: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT user_id, MAX(at) AS last_active
            FROM (
                SELECT user_id, occurred_at AS at FROM interaction_events WHERE occurred_at >= $1
                UNION ALL
                SELECT user_id, occurred_at FROM scroll_events WHERE occurred_at >= $1
                UNION ALL
                SELECT user_id, recorded_at FROM video_watch_sessions WHERE recorded_at >= $1
                UNION ALL
                SELECT actor_id, occurred_at FROM pairwise_interactions WHERE occurred_at >= $1
            ) activity
            WHERE NOT (user_id = ANY($2))
            GROUP BY user_id
            ORDER BY last_active DESC, user_id
            LIMIT $3
            "#,
        )
        .bind(since)
        .bind(exclude)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn last_active_at(&self, user_ids: &[Uuid]) -> Result<HashMap<Uuid, DateTime<Utc>>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT user_id, MAX(at)
            FROM (
                SELECT user_id, occurred_at AS at FROM interaction_events WHERE user_id = ANY($1)
                UNION ALL
                SELECT user_id, occurred_at FROM scroll_events WHERE user_id = ANY($1)
                UNION ALL
                SELECT user_id, recorded_at FROM video_watch_sessions WHERE user_id = ANY($1)
                UNION ALL
                SELECT actor_id, occurred_at FROM pairwise_interactions WHERE actor_id = ANY($1)
            ) activity
            GROUP BY user_id
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn count_pairwise(
        &self,
        relation_id: Uuid,
        actor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM pairwise_interactions
            WHERE relation_id = $1 AND actor_id = $2 AND occurred_at >= $3
            "#,
        )
        .bind(relation_id)
        .bind(actor_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count_to_u32(count))
    }
}

#[async_trait]
impl InterestStore for PgStore {
    async fn get_interest(&self, user_id: Uuid, topic_id: &str) -> Result<Option<InterestScore>> {
        let row = sqlx::query_as::<_, InterestRow>(&format!(
            "SELECT {} FROM interest_scores WHERE user_id = $1 AND topic_id = $2",
            INTEREST_COLUMNS
        ))
        .bind(user_id)
        .bind(topic_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(InterestScore::from))
    }

    async fn reinforce(
        &self,
        user_id: Uuid,
        topic_id: &str,
        weight: f64,
        now: DateTime<Utc>,
    ) -> Result<InterestScore> {
        let row = sqlx::query_as::<_, InterestRow>(&format!(
            r#"
            INSERT INTO interest_scores
                (user_id, topic_id, raw_score, decayed_score, last_reinforced_at,
                 needs_recalculation, is_archived, archived_at, reinforcement_count, created_at)
            VALUES ($1, $2, $3, $3, $4, TRUE, FALSE, NULL, 1, $4)
            ON CONFLICT (user_id, topic_id) DO UPDATE SET
                raw_score = interest_scores.raw_score + EXCLUDED.raw_score,
                decayed_score = interest_scores.raw_score + EXCLUDED.raw_score,
                last_reinforced_at = EXCLUDED.last_reinforced_at,
                needs_recalculation = TRUE,
                is_archived = FALSE,
                archived_at = NULL,
                reinforcement_count = interest_scores.reinforcement_count + 1
            RETURNING {}
            "#,
            INTEREST_COLUMNS
        ))
        .bind(user_id)
        .bind(topic_id)
        .bind(weight)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn list_interests(&self, user_id: Uuid) -> Result<Vec<InterestScore>> {
        let rows = sqlx::query_as::<_, InterestRow>(&format!(
            "SELECT {} FROM interest_scores WHERE user_id = $1 ORDER BY topic_id",
            INTEREST_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InterestScore::from).collect())
    }

    async fn users_with_interests(&self) -> Result<Vec<Uuid>> {
        let users = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT user_id FROM interest_scores ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn apply_decay(
        &self,
        user_id: Uuid,
        updates: &[InterestScore],
        deletions: &[InterestScore],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for update in updates {
            sqlx::query(
                r#"
                UPDATE interest_scores
                SET decayed_score = $3,
                    is_archived = $4,
                    archived_at = $5,
                    needs_recalculation = $6
                WHERE user_id = $1 AND topic_id = $2 AND last_reinforced_at = $7
                "#,
            )
            .bind(user_id)
            .bind(&update.topic_id)
            .bind(update.decayed_score)
            .bind(update.is_archived)
            .bind(update.archived_at)
            .bind(update.needs_recalculation)
            .bind(update.last_reinforced_at)
            .execute(&mut *tx)
            .await?;
        }

        for deletion in deletions {
            sqlx::query(
                r#"
                DELETE FROM interest_scores
                WHERE user_id = $1 AND topic_id = $2 AND is_archived AND last_reinforced_at = $3
                "#,
            )
            .bind(user_id)
            .bind(&deletion.topic_id)
            .bind(deletion.last_reinforced_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn replace_clusters(&self, user_id: Uuid, clusters: &[ContentCluster]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM content_clusters WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        for cluster in clusters {
            let members: Vec<String> = cluster.member_topic_ids.iter().cloned().collect();
            sqlx::query(
                r#"
                INSERT INTO content_clusters (cluster_id, user_id, member_topic_ids, centroid_score, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(cluster.cluster_id)
            .bind(user_id)
            .bind(&members)
            .bind(cluster.centroid_score)
            .bind(cluster.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_clusters(&self, user_id: Uuid) -> Result<Vec<ContentCluster>> {
        let rows = sqlx::query_as::<_, ClusterRow>(
            r#"
            SELECT cluster_id, user_id, member_topic_ids, centroid_score, created_at
            FROM content_clusters
            WHERE user_id = $1
            ORDER BY centroid_score DESC, cluster_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ContentCluster::from).collect())
    }

    async fn users_sharing_topics(
        &self,
        user_id: Uuid,
        topics: &[String],
        exclude: &[Uuid],
        limit: usize,
    ) -> Result<Vec<(Uuid, u32)>> {
        if topics.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS overlap
            FROM interest_scores
            WHERE topic_id = ANY($2)
              AND user_id <> $1
              AND NOT (user_id = ANY($3))
              AND NOT is_archived
            GROUP BY user_id
            ORDER BY overlap DESC, user_id
            LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(topics)
        .bind(exclude)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, n)| (id, count_to_u32(n)))
            .collect())
    }
}

#[async_trait]
impl VideoStore for PgStore {
    async fn append_session(&self, session: &VideoWatchSession) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO video_watch_sessions
                (user_id, post_id, session_id, video_duration, watched_duration, watched_percentage,
                 play_count, pause_count, seek_count, quality_changes, volume_changes,
                 is_completed, exit_point, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (post_id, user_id, session_id) DO NOTHING
            "#,
        )
        .bind(session.user_id)
        .bind(session.post_id)
        .bind(&session.session_id)
        .bind(session.video_duration)
        .bind(session.watched_duration)
        .bind(session.watched_percentage)
        .bind(session.play_count)
        .bind(session.pause_count)
        .bind(session.seek_count)
        .bind(session.quality_changes)
        .bind(session.volume_changes)
        .bind(session.is_completed)
        .bind(session.exit_point)
        .bind(session.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn sessions_for_post(&self, post_id: Uuid) -> Result<Vec<VideoWatchSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT user_id, post_id, session_id, video_duration, watched_duration, watched_percentage,
                   play_count, pause_count, seek_count, quality_changes, volume_changes,
                   is_completed, exit_point, recorded_at
            FROM video_watch_sessions
            WHERE post_id = $1
            ORDER BY user_id, session_id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(VideoWatchSession::from).collect())
    }

    async fn posts_watched_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let posts = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT post_id
            FROM video_watch_sessions
            WHERE recorded_at >= $1
            GROUP BY post_id
            ORDER BY MAX(recorded_at) DESC, post_id
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    async fn upsert_metrics(&self, metrics: &VideoMetrics) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO video_metrics
                (post_id, total_views, unique_viewers, average_watch_time, completion_rate,
                 retention_rate, average_pause_count, average_seek_count, rewatch_rate,
                 average_exit_point, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (post_id) DO UPDATE SET
                total_views = EXCLUDED.total_views,
                unique_viewers = EXCLUDED.unique_viewers,
                average_watch_time = EXCLUDED.average_watch_time,
                completion_rate = EXCLUDED.completion_rate,
                retention_rate = EXCLUDED.retention_rate,
                average_pause_count = EXCLUDED.average_pause_count,
                average_seek_count = EXCLUDED.average_seek_count,
                rewatch_rate = EXCLUDED.rewatch_rate,
                average_exit_point = EXCLUDED.average_exit_point,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(metrics.post_id)
        .bind(metrics.total_views)
        .bind(metrics.unique_viewers)
        .bind(metrics.average_watch_time)
        .bind(metrics.completion_rate)
        .bind(metrics.retention_rate)
        .bind(metrics.average_pause_count)
        .bind(metrics.average_seek_count)
        .bind(metrics.rewatch_rate)
        .bind(metrics.average_exit_point)
        .bind(metrics.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_metrics(&self, post_id: Uuid) -> Result<Option<VideoMetrics>> {
        let row = sqlx::query_as::<_, VideoMetricsRow>(
            r#"
            SELECT post_id, total_views, unique_viewers, average_watch_time, completion_rate,
                   retention_rate, average_pause_count, average_seek_count, rewatch_rate,
                   average_exit_point, updated_at
            FROM video_metrics
            WHERE post_id = $1
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(VideoMetrics::from))
    }
}

#[async_trait]
impl AttractivenessStore for PgStore {
    async fn post_created_at(&self, post_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let created_at =
            sqlx::query_scalar::<_, DateTime<Utc>>("SELECT created_at FROM posts WHERE id = $1")
                .bind(post_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(created_at)
    }

    async fn upsert_score(&self, score: &PostAttractivenessScore) -> Result<()> {
        let c = &score.counts;
        sqlx::query(
            r#"
            INSERT INTO post_attractiveness_scores
                (post_id, views, likes, comments, shares, saves, profile_clicks, hashtag_clicks,
                 raw_score, normalized_score, weights_version, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (post_id) DO UPDATE SET
                views = EXCLUDED.views,
                likes = EXCLUDED.likes,
                comments = EXCLUDED.comments,
                shares = EXCLUDED.shares,
                saves = EXCLUDED.saves,
                profile_clicks = EXCLUDED.profile_clicks,
                hashtag_clicks = EXCLUDED.hashtag_clicks,
                raw_score = EXCLUDED.raw_score,
                normalized_score = EXCLUDED.normalized_score,
                weights_version = EXCLUDED.weights_version,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(score.post_id)
        .bind(c.views)
        .bind(c.likes)
        .bind(c.comments)
        .bind(c.shares)
        .bind(c.saves)
        .bind(c.profile_clicks)
        .bind(c.hashtag_clicks)
        .bind(score.raw_score)
        .bind(score.normalized_score)
        .bind(score.weights_version)
        .bind(score.computed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_score(&self, post_id: Uuid) -> Result<Option<PostAttractivenessScore>> {
        let row = sqlx::query_as::<_, AttractivenessRow>(
            r#"
            SELECT post_id, views, likes, comments, shares, saves, profile_clicks, hashtag_clicks,
                   raw_score, normalized_score, weights_version, computed_at
            FROM post_attractiveness_scores
            WHERE post_id = $1
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(PostAttractivenessScore::from))
    }
}

#[async_trait]
impl SocialGraph for PgStore {
    async fn following(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT following_id FROM follows WHERE follower_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn followees_of_followees(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<(Uuid, u32)>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT f2.following_id, COUNT(*) AS mutual
            FROM follows f1
            JOIN follows f2 ON f2.follower_id = f1.following_id
            WHERE f1.follower_id = $1
              AND f2.following_id <> $1
              AND NOT EXISTS (
                  SELECT 1 FROM follows f3
                  WHERE f3.follower_id = $1 AND f3.following_id = f2.following_id
              )
            GROUP BY f2.following_id
            ORDER BY mutual DESC, f2.following_id
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, n)| (id, count_to_u32(n)))
            .collect())
    }
}

#[async_trait]
impl SuggestionStore for PgStore {
    async fn replace_suggestions(
        &self,
        user_id: Uuid,
        suggestions: &[FollowSuggestion],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM follow_suggestions WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        for (rank, suggestion) in suggestions.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO follow_suggestions
                    (user_id, candidate_id, rank, score, interest_overlap, mutual_follows,
                     recency, reason, generated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(user_id)
            .bind(suggestion.candidate_id)
            .bind(i32::try_from(rank).unwrap_or(i32::MAX))
            .bind(suggestion.score)
            .bind(i32::try_from(suggestion.interest_overlap).unwrap_or(i32::MAX))
            .bind(i32::try_from(suggestion.mutual_follows).unwrap_or(i32::MAX))
            .bind(suggestion.recency)
            .bind(&suggestion.reason)
            .bind(suggestion.generated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_suggestions(&self, user_id: Uuid) -> Result<Vec<FollowSuggestion>> {
        let rows = sqlx::query_as::<_, SuggestionRow>(
            r#"
            SELECT user_id, candidate_id, score, interest_overlap, mutual_follows,
                   recency, reason, generated_at
            FROM follow_suggestions
            WHERE user_id = $1
            ORDER BY rank
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FollowSuggestion::from).collect())
    }
}

#[async_trait]
impl RelationStore for PgStore {
    async fn get_relation(&self, relation_id: Uuid) -> Result<Option<BestFriendRelation>> {
        let row = sqlx::query_as::<_, RelationRow>(&format!(
            r#"
            SELECT {cols} FROM best_friend_relations WHERE id = $1
            UNION ALL
            SELECT {cols} FROM best_friend_relation_history WHERE id = $1
            LIMIT 1
            "#,
            cols = RELATION_COLUMNS
        ))
        .bind(relation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BestFriendRelation::try_from).transpose()
    }

    async fn get_relation_by_pair(&self, pair: PairKey) -> Result<Option<BestFriendRelation>> {
        let row = sqlx::query_as::<_, RelationRow>(&format!(
            "SELECT {} FROM best_friend_relations WHERE user1_id = $1 AND user2_id = $2",
            RELATION_COLUMNS
        ))
        .bind(pair.user1_id)
        .bind(pair.user2_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BestFriendRelation::try_from).transpose()
    }

    async fn save_relation(&self, relation: &BestFriendRelation) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_relation(&mut *tx, relation).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_relation_with_interaction(
        &self,
        relation: &BestFriendRelation,
        interaction: &PairwiseInteraction,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_relation(&mut *tx, relation).await?;
        insert_pairwise(&mut *tx, interaction).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn idle_relations(&self, before: DateTime<Utc>) -> Result<Vec<BestFriendRelation>> {
        let rows = sqlx::query_as::<_, RelationRow>(&format!(
            r#"
            SELECT {}
            FROM best_friend_relations
            WHERE status IN ('PENDING', 'ACTIVE') AND last_interaction < $1
            ORDER BY last_interaction
            "#,
            RELATION_COLUMNS
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BestFriendRelation::try_from).collect()
    }

    async fn insert_permission_request(&self, request: &PermissionRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO permission_requests
                (id, relation_id, requester_id, action, status, requested_at,
                 resolved_at, resolved_by, quota_period)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(request.id)
        .bind(request.relation_id)
        .bind(request.requester_id)
        .bind(request.action.as_str())
        .bind(request.status.as_str())
        .bind(request.requested_at)
        .bind(request.resolved_at)
        .bind(request.resolved_by)
        .bind(request.quota_period)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_permission_request(&self, request_id: Uuid) -> Result<Option<PermissionRequest>> {
        let row = sqlx::query_as::<_, PermissionRow>(&format!(
            "SELECT {} FROM permission_requests WHERE id = $1",
            PERMISSION_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PermissionRequest::try_from).transpose()
    }

    async fn update_permission_request(
        &self,
        request: &PermissionRequest,
        expected: PermissionStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE permission_requests
            SET status = $2, resolved_at = $3, resolved_by = $4
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(request.id)
        .bind(request.status.as_str())
        .bind(request.resolved_at)
        .bind(request.resolved_by)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_permission_request(request.id).await? {
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
            };
        }
        Ok(())
    }

    async fn count_permission_requests(
        &self,
        relation_id: Uuid,
        action: PermissionAction,
        quota_period: DateTime<Utc>,
        statuses: &[PermissionStatus],
    ) -> Result<u32> {
        let statuses: Vec<&str> = statuses.iter().map(PermissionStatus::as_str).collect();
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM permission_requests
            WHERE relation_id = $1 AND action = $2 AND quota_period = $3 AND status = ANY($4)
            "#,
        )
        .bind(relation_id)
        .bind(action.as_str())
        .bind(quota_period)
        .bind(&statuses)
        .fetch_one(&self.pool)
        .await?;
        Ok(count_to_u32(count))
    }

    async fn stale_permission_requests(
        &self,
        requested_before: DateTime<Utc>,
        period_before: DateTime<Utc>,
    ) -> Result<Vec<PermissionRequest>> {
        let rows = sqlx::query_as::<_, PermissionRow>(&format!(
            r#"
            SELECT {}
            FROM permission_requests
            WHERE status = 'REQUESTED' AND (requested_at < $1 OR quota_period < $2)
            ORDER BY requested_at
            "#,
            PERMISSION_COLUMNS
        ))
        .bind(requested_before)
        .bind(period_before)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PermissionRequest::try_from).collect()
    }
}

#[async_trait]
impl RunRecordStore for PgStore {
    async fn insert_run(&self, record: &JobRunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_runs
                (subsystem, started_at, finished_at, duration_ms, items_processed, items_failed, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.subsystem.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.duration_ms)
        .bind(record.items_processed)
        .bind(record.items_failed)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_runs(&self) -> Result<Vec<JobRunRecord>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT DISTINCT ON (subsystem)
                   subsystem, started_at, finished_at, duration_ms, items_processed, items_failed, error
            FROM job_runs
            ORDER BY subsystem, finished_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRunRecord::try_from).collect()
    }

    async fn recent_runs(&self, subsystem: Subsystem, limit: usize) -> Result<Vec<JobRunRecord>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT subsystem, started_at, finished_at, duration_ms, items_processed, items_failed, error
            FROM job_runs
            WHERE subsystem = $1
            ORDER BY finished_at DESC
            LIMIT $2
            "#,
        )
        .bind(subsystem.as_str())
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRunRecord::try_from).collect()
    }
}
