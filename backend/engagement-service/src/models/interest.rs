use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EngagementError;

/// Per-user, per-topic affinity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterestScore {
    pub user_id: Uuid,
    pub topic_id: String,
    /// Sum of every reinforcement weight; never decreases
    pub raw_score: f64,
    /// raw_score decayed by the time since last_reinforced_at
    pub decayed_score: f64,
    pub last_reinforced_at: DateTime<Utc>,
    pub needs_recalculation: bool,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub reinforcement_count: i64,
    pub created_at: DateTime<Utc>,
}

impl InterestScore {
    pub fn new(user_id: Uuid, topic_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            topic_id: topic_id.into(),
            raw_score: 0.0,
            decayed_score: 0.0,
            last_reinforced_at: now,
            needs_recalculation: true,
            is_archived: false,
            archived_at: None,
            reinforcement_count: 0,
            created_at: now,
        }
    }
}

/// A group of topically related interests of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentCluster {
    pub cluster_id: Uuid,
    pub user_id: Uuid,
    pub member_topic_ids: BTreeSet<String>,
    /// Mean decayed score of the members
    pub centroid_score: f64,
    pub created_at: DateTime<Utc>,
}

/// Engagement kinds recorded against posts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    View,
    Like,
    Comment,
    Share,
    Save,
    ProfileClick,
    HashtagClick,
}

impl EngagementKind {
    pub const ALL: [EngagementKind; 7] = [
        EngagementKind::View,
        EngagementKind::Like,
        EngagementKind::Comment,
        EngagementKind::Share,
        EngagementKind::Save,
        EngagementKind::ProfileClick,
        EngagementKind::HashtagClick,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementKind::View => "view",
            EngagementKind::Like => "like",
            EngagementKind::Comment => "comment",
            EngagementKind::Share => "share",
            EngagementKind::Save => "save",
            EngagementKind::ProfileClick => "profile_click",
            EngagementKind::HashtagClick => "hashtag_click",
        }
    }

    /// Interest reinforcement weight of one event of this kind
    pub fn interest_weight(&self) -> f64 {
        match self {
            EngagementKind::View => 0.5,
            EngagementKind::Like => 1.0,
            EngagementKind::Comment => 2.0,
            EngagementKind::Share => 3.0,
            EngagementKind::Save => 2.5,
            EngagementKind::ProfileClick => 0.5,
            EngagementKind::HashtagClick => 1.5,
        }
    }
}

impl FromStr for EngagementKind {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(EngagementKind::View),
            "like" => Ok(EngagementKind::Like),
            "comment" => Ok(EngagementKind::Comment),
            "share" => Ok(EngagementKind::Share),
            "save" => Ok(EngagementKind::Save),
            "profile_click" => Ok(EngagementKind::ProfileClick),
            "hashtag_click" => Ok(EngagementKind::HashtagClick),
            other => Err(EngagementError::validation(format!(
                "unknown engagement kind: {}",
                other
            ))),
        }
    }
}

/// Raw engagement event on a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub post_author_id: Uuid,
    pub kind: EngagementKind,
    /// Topic tags of the post
    pub topics: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Raw scroll-depth event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollEvent {
    pub user_id: Uuid,
    pub post_id: Uuid,
    /// 0.0 ..= 1.0
    pub scroll_depth: f64,
    pub dwell_ms: u64,
    pub topics: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}
