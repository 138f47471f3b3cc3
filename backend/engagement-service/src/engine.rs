//! Public entry point wiring every engine to one set of stores

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::jobs::{
    AttractivenessJob, HealthMonitor, InterestMaintenanceJob, RelationshipMaintenanceJob,
    Scheduler, SuggestionJob, VideoMetricsJob,
};
use crate::models::{
    BestFriendRelation, ContentCluster, FollowSuggestion, InteractionEvent, InteractionMetadata,
    InteractionOutcome, InteractionType, InterestScore, PerformanceMetrics, PermissionAction,
    PermissionRequest, PostAttractivenessScore, Privileges, RelationRef, RelationStats,
    ScrollEvent, VideoMetrics, VideoWatchSession,
};
use crate::notifier::AlertSink;
use crate::repository::Repositories;
use crate::services::{
    AttractivenessScorer, BestFriendEngine, FollowSuggestionGenerator, InterestDecayEngine,
    VideoMetricsAggregator,
};

pub struct EngagementEngine {
    interests: Arc<InterestDecayEngine>,
    videos: Arc<VideoMetricsAggregator>,
    attractiveness: Arc<AttractivenessScorer>,
    suggestions: Arc<FollowSuggestionGenerator>,
    relationships: Arc<BestFriendEngine>,
    health: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl EngagementEngine {
    pub fn new(
        config: Config,
        repos: Repositories,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let retry = config.store_retry.to_retry_config();

        let interests = Arc::new(InterestDecayEngine::new(
            repos.interests.clone(),
            repos.events.clone(),
            clock.clone(),
            config.decay.clone(),
            config.clustering.clone(),
            config.scroll.clone(),
            retry.clone(),
        ));
        let videos = Arc::new(VideoMetricsAggregator::new(
            repos.videos.clone(),
            clock.clone(),
            config.video_metrics.clone(),
            retry.clone(),
        ));
        let attractiveness = Arc::new(AttractivenessScorer::new(
            repos.events.clone(),
            repos.attractiveness.clone(),
            clock.clone(),
            config.attractiveness.clone(),
            retry.clone(),
        ));
        let suggestions = Arc::new(FollowSuggestionGenerator::new(
            repos.interests.clone(),
            repos.graph.clone(),
            repos.events.clone(),
            repos.suggestions.clone(),
            clock.clone(),
            config.suggestions.clone(),
            retry.clone(),
        ));
        let relationships = Arc::new(BestFriendEngine::new(
            repos.relations.clone(),
            repos.events.clone(),
            clock.clone(),
            config.relationship.clone(),
            retry,
        ));
        let health = Arc::new(HealthMonitor::new(
            repos.runs.clone(),
            alerts,
            config.health.clone(),
        ));

        Self {
            interests,
            videos,
            attractiveness,
            suggestions,
            relationships,
            health,
            clock,
            config,
        }
    }

    /// Scheduler holding one job per subsystem, not yet started
    pub fn scheduler(&self) -> Scheduler {
        let s = &self.config.scheduler;
        Scheduler::new(self.health.clone(), self.clock.clone(), s.run_on_start)
            .with_job(Arc::new(InterestMaintenanceJob::new(
                self.interests.clone(),
                Duration::from_secs(s.interest_interval_secs),
            )))
            .with_job(Arc::new(VideoMetricsJob::new(
                self.videos.clone(),
                Duration::from_secs(s.video_metrics_interval_secs),
            )))
            .with_job(Arc::new(AttractivenessJob::new(
                self.attractiveness.clone(),
                Duration::from_secs(s.attractiveness_interval_secs),
            )))
            .with_job(Arc::new(SuggestionJob::new(
                self.suggestions.clone(),
                Duration::from_secs(s.suggestions_interval_secs),
            )))
            .with_job(Arc::new(RelationshipMaintenanceJob::new(
                self.relationships.clone(),
                Duration::from_secs(s.relationship_interval_secs),
            )))
    }

    pub fn interest_engine(&self) -> &Arc<InterestDecayEngine> {
        &self.interests
    }

    pub fn video_aggregator(&self) -> &Arc<VideoMetricsAggregator> {
        &self.videos
    }

    pub fn attractiveness_scorer(&self) -> &Arc<AttractivenessScorer> {
        &self.attractiveness
    }

    pub fn suggestion_generator(&self) -> &Arc<FollowSuggestionGenerator> {
        &self.suggestions
    }

    pub fn relationship_engine(&self) -> &Arc<BestFriendEngine> {
        &self.relationships
    }

    // Interests

    pub async fn reinforce_interest(
        &self,
        user_id: Uuid,
        topic_id: &str,
        weight: f64,
    ) -> Result<InterestScore> {
        self.interests.reinforce(user_id, topic_id, weight).await
    }

    pub async fn get_active_interests(&self, user_id: Uuid) -> Result<Vec<InterestScore>> {
        self.interests.get_active_interests(user_id).await
    }

    pub async fn ingest_interaction_event(
        &self,
        event: &InteractionEvent,
    ) -> Result<Vec<InterestScore>> {
        self.interests.ingest_interaction(event).await
    }

    pub async fn ingest_scroll_event(&self, event: &ScrollEvent) -> Result<Vec<InterestScore>> {
        self.interests.ingest_scroll(event).await
    }

    pub async fn clusterize(&self, user_id: Uuid) -> Result<Vec<ContentCluster>> {
        self.interests.clusterize(user_id).await
    }

    pub async fn get_content_clusters(&self, user_id: Uuid) -> Result<Vec<ContentCluster>> {
        self.interests.get_content_clusters(user_id).await
    }

    // Video

    pub async fn record_watch_session(&self, session: &VideoWatchSession) -> Result<bool> {
        self.videos.record_watch_session(session).await
    }

    pub async fn get_video_metrics(&self, post_id: Uuid) -> Result<VideoMetrics> {
        self.videos.get_metrics(post_id).await
    }

    pub async fn recompute_video_metrics(&self, post_id: Uuid) -> Result<VideoMetrics> {
        self.videos.recompute(post_id).await
    }

    // Posts

    pub async fn get_attractiveness_score(&self, post_id: Uuid) -> Result<PostAttractivenessScore> {
        self.attractiveness.get_score(post_id).await
    }

    // Suggestions

    pub async fn generate_follow_suggestions(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<FollowSuggestion>> {
        self.suggestions.generate(user_id, limit).await
    }

    pub async fn get_cached_suggestions(&self, user_id: Uuid) -> Result<Vec<FollowSuggestion>> {
        self.suggestions.get_cached(user_id).await
    }

    // Relationships

    pub async fn record_interaction(
        &self,
        user_id: Uuid,
        post_id: Uuid,
        post_author_id: Uuid,
        kind: InteractionType,
        metadata: &InteractionMetadata,
    ) -> Result<InteractionOutcome> {
        self.relationships
            .record_interaction(user_id, post_id, post_author_id, kind, metadata)
            .await
    }

    pub async fn request_permission(
        &self,
        relation_id: Uuid,
        requester_id: Uuid,
        action: PermissionAction,
    ) -> Result<PermissionRequest> {
        self.relationships
            .request_permission(relation_id, requester_id, action)
            .await
    }

    pub async fn respond_to_permission_request(
        &self,
        request_id: Uuid,
        responder_id: Uuid,
        approve: bool,
    ) -> Result<PermissionRequest> {
        self.relationships
            .respond_to_permission_request(request_id, responder_id, approve)
            .await
    }

    pub async fn get_privileges(&self, relation_id: Uuid) -> Result<Privileges> {
        self.relationships.get_privileges(relation_id).await
    }

    pub async fn get_relation_stats(&self, reference: RelationRef) -> Result<RelationStats> {
        self.relationships.get_relation_stats(reference).await
    }

    pub async fn pause_relation(&self, relation_id: Uuid) -> Result<BestFriendRelation> {
        self.relationships.pause_relation(relation_id).await
    }

    pub async fn terminate_relation(
        &self,
        relation_id: Uuid,
        user_id: Uuid,
    ) -> Result<BestFriendRelation> {
        self.relationships
            .terminate_relation(relation_id, user_id)
            .await
    }

    // Health

    pub async fn run_health_check(&self) -> Result<Vec<PerformanceMetrics>> {
        self.health.run_health_check().await
    }

    /// Prometheus text exposition of the job metrics, for the host's scrape endpoint
    pub fn metrics_text(&self) -> String {
        crate::metrics::gather_text()
    }
}
