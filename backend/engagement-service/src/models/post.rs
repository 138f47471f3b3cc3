use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::interest::EngagementKind;

/// Engagement counts of a post, one per [`EngagementKind`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementCounts {
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub saves: i64,
    pub profile_clicks: i64,
    pub hashtag_clicks: i64,
}

impl EngagementCounts {
    pub fn get(&self, kind: EngagementKind) -> i64 {
        match kind {
            EngagementKind::View => self.views,
            EngagementKind::Like => self.likes,
            EngagementKind::Comment => self.comments,
            EngagementKind::Share => self.shares,
            EngagementKind::Save => self.saves,
            EngagementKind::ProfileClick => self.profile_clicks,
            EngagementKind::HashtagClick => self.hashtag_clicks,
        }
    }

    pub fn add(&mut self, kind: EngagementKind, n: i64) {
        match kind {
            EngagementKind::View => self.views += n,
            EngagementKind::Like => self.likes += n,
            EngagementKind::Comment => self.comments += n,
            EngagementKind::Share => self.shares += n,
            EngagementKind::Save => self.saves += n,
            EngagementKind::ProfileClick => self.profile_clicks += n,
            EngagementKind::HashtagClick => self.hashtag_clicks += n,
        }
    }
}

/// Ranking score of a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostAttractivenessScore {
    pub post_id: Uuid,
    pub counts: EngagementCounts,
    /// Weighted engagement sum; never decreases
    pub raw_score: f64,
    /// raw_score normalised by post age and views
    pub normalized_score: f64,
    pub weights_version: i32,
    pub computed_at: DateTime<Utc>,
}
