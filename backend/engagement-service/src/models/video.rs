//! Video watch sessions and per-post aggregates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One watch session; append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoWatchSession {
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub session_id: String,
    /// Seconds
    pub video_duration: f64,
    /// Seconds
    pub watched_duration: f64,
    /// 0 ..= 100
    pub watched_percentage: f64,
    pub play_count: i32,
    pub pause_count: i32,
    pub seek_count: i32,
    pub quality_changes: i32,
    pub volume_changes: i32,
    pub is_completed: bool,
    /// Playback position in seconds when the viewer left
    pub exit_point: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate watch metrics of one post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetrics {
    pub post_id: Uuid,
    pub total_views: i64,
    pub unique_viewers: i64,
    /// Mean watched duration in seconds
    pub average_watch_time: f64,
    /// Fraction of sessions that completed
    pub completion_rate: f64,
    /// Mean watched percentage
    pub retention_rate: f64,
    pub average_pause_count: f64,
    pub average_seek_count: f64,
    /// Fraction of sessions with more than one play
    pub rewatch_rate: f64,
    pub average_exit_point: f64,
    pub updated_at: DateTime<Utc>,
}

impl VideoMetrics {
    pub fn empty(post_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            post_id,
            total_views: 0,
            unique_viewers: 0,
            average_watch_time: 0.0,
            completion_rate: 0.0,
            retention_rate: 0.0,
            average_pause_count: 0.0,
            average_seek_count: 0.0,
            rewatch_rate: 0.0,
            average_exit_point: 0.0,
            updated_at: now,
        }
    }
}
