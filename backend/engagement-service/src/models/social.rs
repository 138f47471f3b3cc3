use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Suggested user with score and the signals behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowSuggestion {
    pub user_id: Uuid,
    pub candidate_id: Uuid,
    pub score: f64,
    pub interest_overlap: u32,
    pub mutual_follows: u32,
    /// 0.0 ..= 1.0
    pub recency: f64,
    pub reason: String, // e.g. "3 shared interests"
    pub generated_at: DateTime<Utc>,
}
