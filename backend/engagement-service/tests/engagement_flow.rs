//! End-to-end flows through `EngagementEngine` over the in-memory store

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

use engagement_service::config::{Config, StorageBackend};
use engagement_service::jobs::{self, HealthMonitor, VideoMetricsJob};
use engagement_service::models::{
    Badge, EngagementKind, HealthStatus, InteractionEvent, InteractionMetadata, InteractionType,
    PairKey, PermissionAction, RelationRef, RelationStatus, RelationshipTier, Subsystem,
    VideoWatchSession,
};
use engagement_service::notifier::LogAlertSink;
use engagement_service::repository::{InterestStore, MemoryStore, RelationStore, Repositories};
use engagement_service::{EngagementEngine, EngagementError, ManualClock};

struct TestEnv {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    engine: EngagementEngine,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 10, 0, 0).unwrap()
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.database.backend = StorageBackend::Memory;
    config.store_retry.max_retries = 0;
    config
}

fn setup() -> TestEnv {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let engine = EngagementEngine::new(
        test_config(),
        Repositories::from_store(store.clone()),
        clock.clone(),
        Arc::new(LogAlertSink),
    );
    TestEnv {
        store,
        clock,
        engine,
    }
}

fn session(post_id: Uuid, id: &str, watched: f64) -> VideoWatchSession {
    VideoWatchSession {
        user_id: Uuid::new_v4(),
        post_id,
        session_id: id.to_string(),
        video_duration: 30.0,
        watched_duration: watched,
        watched_percentage: watched / 30.0 * 100.0,
        play_count: 1,
        pause_count: 0,
        seek_count: 2,
        quality_changes: 0,
        volume_changes: 1,
        is_completed: watched >= 30.0,
        exit_point: watched,
        recorded_at: start(),
    }
}

async fn like(env: &TestEnv, actor: Uuid, author: Uuid) {
    env.engine
        .record_interaction(
            actor,
            Uuid::new_v4(),
            author,
            InteractionType::Like,
            &InteractionMetadata::default(),
        )
        .await
        .unwrap();
}

async fn activate(env: &TestEnv, a: Uuid, b: Uuid) -> Uuid {
    for _ in 0..3 {
        like(env, a, b).await;
        like(env, b, a).await;
    }
    let relation = env
        .store
        .get_relation_by_pair(PairKey::new(a, b).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relation.status, RelationStatus::Active);
    relation.id
}

#[tokio::test]
async fn decay_pass_is_deterministic() {
    let env = setup();
    let user = Uuid::new_v4();
    env.engine.reinforce_interest(user, "cooking", 4.0).await.unwrap();
    env.engine.reinforce_interest(user, "cycling", 9.0).await.unwrap();

    env.clock.advance(Duration::days(5));
    let decay = env.engine.interest_engine();
    decay.run_decay_pass().await.unwrap();
    let first = env.store.list_interests(user).await.unwrap();
    decay.run_decay_pass().await.unwrap();
    let second = env.store.list_interests(user).await.unwrap();

    assert_eq!(first, second);
    let cycling = first.iter().find(|s| s.topic_id == "cycling").unwrap();
    let expected = 9.0 * (-(std::f64::consts::LN_2 / 14.0) * 5.0).exp();
    assert!((cycling.decayed_score - expected).abs() < 1e-9);
}

#[tokio::test]
async fn travel_interest_archives_after_thirty_half_lives() {
    let env = setup();
    let user = Uuid::new_v4();
    env.engine.reinforce_interest(user, "travel", 10.0).await.unwrap();

    env.clock.advance(Duration::days(30 * 14));
    env.engine.interest_engine().run_decay_pass().await.unwrap();

    let score = env.store.get_interest(user, "travel").await.unwrap().unwrap();
    let expected = 10.0 * (-30.0 * std::f64::consts::LN_2).exp();
    assert!((score.decayed_score - expected).abs() < 1e-12);
    assert!(score.decayed_score < 1e-8);
    assert!(score.is_archived);
    assert!(env.engine.get_active_interests(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn archival_only_reverts_through_reinforcement() {
    let env = setup();
    let user = Uuid::new_v4();
    env.engine.reinforce_interest(user, "chess", 1.0).await.unwrap();

    env.clock.advance(Duration::days(30));
    let decay = env.engine.interest_engine();
    decay.run_decay_pass().await.unwrap();
    assert!(env.store.get_interest(user, "chess").await.unwrap().unwrap().is_archived);

    env.clock.advance(Duration::days(3));
    decay.run_decay_pass().await.unwrap();
    assert!(env.store.get_interest(user, "chess").await.unwrap().unwrap().is_archived);

    let revived = env.engine.reinforce_interest(user, "chess", 2.0).await.unwrap();
    assert!(!revived.is_archived);
    assert_eq!(revived.decayed_score, revived.raw_score);
    assert_eq!(env.engine.get_active_interests(user).await.unwrap().len(), 1);
}

#[tokio::test]
async fn interaction_events_feed_interests_and_attractiveness() {
    let env = setup();
    let (reader, author, post) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    env.store.register_post(post, start() - Duration::hours(2));

    for kind in [EngagementKind::View, EngagementKind::Like, EngagementKind::Share] {
        env.engine
            .ingest_interaction_event(&InteractionEvent {
                user_id: reader,
                post_id: post,
                post_author_id: author,
                kind,
                topics: vec!["Hiking".into(), "photography".into()],
                occurred_at: start(),
            })
            .await
            .unwrap();
    }

    let interests = env.engine.get_active_interests(reader).await.unwrap();
    assert_eq!(interests.len(), 2);

    let score = env.engine.get_attractiveness_score(post).await.unwrap();
    assert_eq!(score.counts.get(EngagementKind::Share), 1);
    assert!(score.raw_score > 0.0);
    assert!(score.normalized_score < score.raw_score);
}

#[tokio::test]
async fn video_recompute_is_idempotent() {
    let env = setup();
    let post = Uuid::new_v4();
    for (i, watched) in [30.0, 12.5, 3.3].into_iter().enumerate() {
        env.engine
            .record_watch_session(&session(post, &format!("s{}", i), watched))
            .await
            .unwrap();
    }
    let first = env.engine.recompute_video_metrics(post).await.unwrap();
    let second = env.engine.recompute_video_metrics(post).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.total_views, 3);

    let empty = env.engine.get_video_metrics(Uuid::new_v4()).await.unwrap();
    assert_eq!(empty.total_views, 0);
    assert_eq!(empty.completion_rate, 0.0);
    assert_eq!(empty.retention_rate, 0.0);
}

#[tokio::test]
async fn shared_interests_rank_suggestions() {
    let env = setup();
    let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    for topic in ["jazz", "coffee", "film"] {
        env.engine.reinforce_interest(u1, topic, 1.0).await.unwrap();
        env.engine.reinforce_interest(u2, topic, 1.0).await.unwrap();
    }
    env.engine.reinforce_interest(u3, "film", 1.0).await.unwrap();

    let suggestions = env.engine.generate_follow_suggestions(u1, 5).await.unwrap();
    assert_eq!(suggestions[0].candidate_id, u2);
    assert_eq!(suggestions[1].candidate_id, u3);
    assert!(suggestions[0].score > suggestions[1].score);
}

#[tokio::test]
async fn self_interaction_never_scores() {
    let env = setup();
    let me = Uuid::new_v4();
    for kind in [InteractionType::Share, InteractionType::Reply] {
        let outcome = env
            .engine
            .record_interaction(me, Uuid::new_v4(), me, kind, &InteractionMetadata::default())
            .await
            .unwrap();
        assert_eq!(outcome.points_awarded, 0);
        assert!(!outcome.relation_updated);
    }
}

#[tokio::test]
async fn relation_totals_always_match_sides() {
    let env = setup();
    let users: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let kinds = [
        InteractionType::View,
        InteractionType::Comment,
        InteractionType::Mention,
        InteractionType::Reply,
    ];
    for step in 0..24usize {
        let actor = users[step % 3];
        let author = users[(step / 3 + 1 + step) % 3];
        if actor == author {
            continue;
        }
        let metadata = InteractionMetadata {
            reaction_delay_secs: Some((step as i64) * 400),
            is_reciprocal: step % 2 == 0,
            topic_similarity: Some((step % 5) as f64 / 4.0),
            local_hour: Some((step % 24) as u32),
        };
        env.engine
            .record_interaction(actor, Uuid::new_v4(), author, kinds[step % 4], &metadata)
            .await
            .unwrap();
    }

    for (i, a) in users.iter().enumerate() {
        for b in users.iter().skip(i + 1) {
            if let Some(relation) = env
                .store
                .get_relation_by_pair(PairKey::new(*a, *b).unwrap())
                .await
                .unwrap()
            {
                assert_eq!(
                    relation.total_points,
                    relation.user1_points + relation.user2_points
                );
            }
        }
    }
}

#[tokio::test]
async fn strong_badge_is_reported_once() {
    let env = setup();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let mut strong_unlocks = 0;
    for _ in 0..40 {
        let outcome = env
            .engine
            .record_interaction(
                a,
                Uuid::new_v4(),
                b,
                InteractionType::Comment,
                &InteractionMetadata::default(),
            )
            .await
            .unwrap();
        if outcome.newly_unlocked_badges.contains(&Badge::CloseFriend) {
            strong_unlocks += 1;
            assert_eq!(outcome.relation.unwrap().total_points, 200);
        }
    }
    assert_eq!(strong_unlocks, 1);
}

#[tokio::test]
async fn second_bonus_post_in_period_exceeds_quota() {
    let env = setup();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let relation_id = activate(&env, a, b).await;
    for _ in 0..24 {
        env.engine
            .record_interaction(
                b,
                Uuid::new_v4(),
                a,
                InteractionType::Share,
                &InteractionMetadata::default(),
            )
            .await
            .unwrap();
    }
    let privileges = env.engine.get_privileges(relation_id).await.unwrap();
    assert_eq!(privileges.tier, RelationshipTier::Strong);
    assert_eq!(privileges.extra_posts_per_period, 1);

    let request = env
        .engine
        .request_permission(relation_id, a, PermissionAction::ExtraPost)
        .await
        .unwrap();
    env.engine
        .respond_to_permission_request(request.id, b, true)
        .await
        .unwrap();

    let err = env
        .engine
        .request_permission(relation_id, a, PermissionAction::ExtraPost)
        .await
        .unwrap_err();
    assert!(matches!(err, EngagementError::QuotaExceeded { .. }));

    // the next period starts with a fresh allowance
    env.clock.advance(Duration::days(7));
    like(&env, a, b).await;
    assert!(env
        .engine
        .request_permission(relation_id, a, PermissionAction::ExtraPost)
        .await
        .is_ok());

    let stats = env
        .engine
        .get_relation_stats(RelationRef::Pair(a, b))
        .await
        .unwrap();
    assert_eq!(stats.tier, RelationshipTier::Strong);
    assert_eq!(stats.next_tier, Some(RelationshipTier::Best));
}

#[tokio::test]
async fn store_outage_marks_run_as_error() {
    let env = setup();
    let monitor = HealthMonitor::new(
        env.store.clone(),
        Arc::new(LogAlertSink),
        Default::default(),
    );
    let job = VideoMetricsJob::new(
        env.engine.video_aggregator().clone(),
        std::time::Duration::from_secs(3600),
    );

    env.store.set_unavailable(true);
    let mut failures = 0;
    let metrics = jobs::run_once(&job, &monitor, env.clock.as_ref(), &mut failures).await;
    assert_eq!(metrics.status, HealthStatus::Error);
    assert_eq!(metrics.success_rate, 0.0);
    assert_eq!(failures, 1);

    // the run record could not be written while the store was down
    env.store.set_unavailable(false);
    let metrics = jobs::run_once(&job, &monitor, env.clock.as_ref(), &mut failures).await;
    assert_eq!(metrics.status, HealthStatus::Healthy);
    assert_eq!(failures, 0);

    let snapshot = env.engine.run_health_check().await.unwrap();
    let video = snapshot
        .iter()
        .find(|m| m.subsystem == Subsystem::VideoMetrics)
        .unwrap();
    assert_eq!(video.status, HealthStatus::Healthy);
    assert!(video.last_run_at.is_some());
}

#[tokio::test]
async fn job_runs_are_visible_in_metrics_text() {
    let env = setup();
    let monitor = HealthMonitor::new(
        env.store.clone(),
        Arc::new(LogAlertSink),
        Default::default(),
    );
    let job = VideoMetricsJob::new(
        env.engine.video_aggregator().clone(),
        std::time::Duration::from_secs(3600),
    );
    let mut failures = 0;
    jobs::run_once(&job, &monitor, env.clock.as_ref(), &mut failures).await;

    let text = env.engine.metrics_text();
    assert!(text.contains("engagement_job_runs_total"));
    assert!(text.contains("job_name=\"video_metrics\""));
    assert!(text.contains("engagement_job_health"));
}
