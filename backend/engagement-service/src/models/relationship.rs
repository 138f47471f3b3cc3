//! Best-friend relation, permission requests and derived privileges

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{EngagementError, Result};

/// Canonical identity of an unordered user pair: `user1_id < user2_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub user1_id: Uuid,
    pub user2_id: Uuid,
}

impl PairKey {
    pub fn new(a: Uuid, b: Uuid) -> Result<Self> {
        if a == b {
            return Err(EngagementError::validation(
                "a relation needs two distinct users",
            ));
        }
        if a.is_nil() || b.is_nil() {
            return Err(EngagementError::validation("user id must not be nil"));
        }
        let (user1_id, user2_id) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { user1_id, user2_id })
    }

    pub fn side_of(&self, user_id: Uuid) -> Option<Side> {
        if user_id == self.user1_id {
            Some(Side::User1)
        } else if user_id == self.user2_id {
            Some(Side::User2)
        } else {
            None
        }
    }

    pub fn other(&self, user_id: Uuid) -> Option<Uuid> {
        match self.side_of(user_id)? {
            Side::User1 => Some(self.user2_id),
            Side::User2 => Some(self.user1_id),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user1_id, self.user2_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    User1,
    User2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationStatus {
    Pending,
    Active,
    Paused,
    Ended,
}

impl RelationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationStatus::Pending => "PENDING",
            RelationStatus::Active => "ACTIVE",
            RelationStatus::Paused => "PAUSED",
            RelationStatus::Ended => "ENDED",
        }
    }
}

impl FromStr for RelationStatus {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(RelationStatus::Pending),
            "ACTIVE" => Ok(RelationStatus::Active),
            "PAUSED" => Ok(RelationStatus::Paused),
            "ENDED" => Ok(RelationStatus::Ended),
            other => Err(EngagementError::validation(format!(
                "unknown relation status: {}",
                other
            ))),
        }
    }
}

/// Ordered relationship strength
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipTier {
    New,
    Growing,
    Strong,
    Best,
}

impl RelationshipTier {
    pub const ALL: [RelationshipTier; 4] = [
        RelationshipTier::New,
        RelationshipTier::Growing,
        RelationshipTier::Strong,
        RelationshipTier::Best,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipTier::New => "NEW",
            RelationshipTier::Growing => "GROWING",
            RelationshipTier::Strong => "STRONG",
            RelationshipTier::Best => "BEST",
        }
    }

    pub fn next(&self) -> Option<RelationshipTier> {
        match self {
            RelationshipTier::New => Some(RelationshipTier::Growing),
            RelationshipTier::Growing => Some(RelationshipTier::Strong),
            RelationshipTier::Strong => Some(RelationshipTier::Best),
            RelationshipTier::Best => None,
        }
    }

    /// Badge unlocked on reaching this tier
    pub fn badge(&self) -> Option<Badge> {
        match self {
            RelationshipTier::New => None,
            RelationshipTier::Growing => Some(Badge::RisingFriend),
            RelationshipTier::Strong => Some(Badge::CloseFriend),
            RelationshipTier::Best => Some(Badge::BestFriend),
        }
    }
}

impl FromStr for RelationshipTier {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(RelationshipTier::New),
            "GROWING" => Ok(RelationshipTier::Growing),
            "STRONG" => Ok(RelationshipTier::Strong),
            "BEST" => Ok(RelationshipTier::Best),
            other => Err(EngagementError::validation(format!(
                "unknown relationship tier: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Badge {
    RisingFriend,
    CloseFriend,
    BestFriend,
}

impl Badge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Badge::RisingFriend => "rising_friend",
            Badge::CloseFriend => "close_friend",
            Badge::BestFriend => "best_friend",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestFriendRelation {
    pub id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub status: RelationStatus,
    pub user1_points: i64,
    pub user2_points: i64,
    pub total_points: i64,
    pub relationship_strength: RelationshipTier,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub last_interaction: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token; bumped on every write
    pub version: i64,
}

impl BestFriendRelation {
    pub fn new(pair: PairKey, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user1_id: pair.user1_id,
            user2_id: pair.user2_id,
            status: RelationStatus::Pending,
            user1_points: 0,
            user2_points: 0,
            total_points: 0,
            relationship_strength: RelationshipTier::New,
            start_date: now,
            end_date: None,
            last_interaction: now,
            paused_at: None,
            version: 0,
        }
    }

    pub fn pair(&self) -> PairKey {
        PairKey {
            user1_id: self.user1_id,
            user2_id: self.user2_id,
        }
    }

    pub fn is_member(&self, user_id: Uuid) -> bool {
        user_id == self.user1_id || user_id == self.user2_id
    }

    /// Credit points to one side and keep the total in step
    pub fn add_points(&mut self, side: Side, points: i64) {
        match side {
            Side::User1 => self.user1_points += points,
            Side::User2 => self.user2_points += points,
        }
        self.total_points = self.user1_points + self.user2_points;
    }
}

/// Interaction types that earn relationship points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    View,
    Like,
    Comment,
    Reply,
    Share,
    Save,
    Mention,
}

impl InteractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::View => "view",
            InteractionType::Like => "like",
            InteractionType::Comment => "comment",
            InteractionType::Reply => "reply",
            InteractionType::Share => "share",
            InteractionType::Save => "save",
            InteractionType::Mention => "mention",
        }
    }

    /// Points before metadata multipliers
    pub fn base_points(&self) -> f64 {
        match self {
            InteractionType::View => 1.0,
            InteractionType::Like => 2.0,
            InteractionType::Save => 3.0,
            InteractionType::Mention => 4.0,
            InteractionType::Comment => 5.0,
            InteractionType::Reply => 6.0,
            InteractionType::Share => 8.0,
        }
    }
}

impl FromStr for InteractionType {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "view" => Ok(InteractionType::View),
            "like" => Ok(InteractionType::Like),
            "comment" => Ok(InteractionType::Comment),
            "reply" => Ok(InteractionType::Reply),
            "share" => Ok(InteractionType::Share),
            "save" => Ok(InteractionType::Save),
            "mention" => Ok(InteractionType::Mention),
            other => Err(EngagementError::validation(format!(
                "unknown interaction type: {}",
                other
            ))),
        }
    }
}

/// Context that scales the base points of an interaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionMetadata {
    /// Seconds between the post going live and this interaction
    pub reaction_delay_secs: Option<i64>,
    /// The target recently interacted with the actor's content
    pub is_reciprocal: bool,
    /// 0.0 ..= 1.0 overlap between the two users' interests
    pub topic_similarity: Option<f64>,
    /// Actor's local hour, 0..=23
    pub local_hour: Option<u32>,
}

/// Pairwise interaction log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseInteraction {
    pub relation_id: Uuid,
    pub actor_id: Uuid,
    pub target_id: Uuid,
    pub post_id: Uuid,
    pub interaction_type: InteractionType,
    pub points_awarded: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    ExtraPost,
    ExtraComment,
}

impl PermissionAction {
    pub const ALL: [PermissionAction; 2] =
        [PermissionAction::ExtraPost, PermissionAction::ExtraComment];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionAction::ExtraPost => "extra_post",
            PermissionAction::ExtraComment => "extra_comment",
        }
    }
}

impl FromStr for PermissionAction {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "extra_post" => Ok(PermissionAction::ExtraPost),
            "extra_comment" => Ok(PermissionAction::ExtraComment),
            other => Err(EngagementError::validation(format!(
                "unknown permission action: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionStatus {
    Requested,
    Approved,
    Denied,
    Expired,
}

impl PermissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionStatus::Requested => "REQUESTED",
            PermissionStatus::Approved => "APPROVED",
            PermissionStatus::Denied => "DENIED",
            PermissionStatus::Expired => "EXPIRED",
        }
    }
}

impl FromStr for PermissionStatus {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REQUESTED" => Ok(PermissionStatus::Requested),
            "APPROVED" => Ok(PermissionStatus::Approved),
            "DENIED" => Ok(PermissionStatus::Denied),
            "EXPIRED" => Ok(PermissionStatus::Expired),
            other => Err(EngagementError::validation(format!(
                "unknown permission status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: Uuid,
    pub relation_id: Uuid,
    pub requester_id: Uuid,
    pub action: PermissionAction,
    pub status: PermissionStatus,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    /// Start of the quota period this request counts against
    pub quota_period: DateTime<Utc>,
}

/// Read-only privilege view derived from the tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Privileges {
    pub tier: RelationshipTier,
    pub badge: Option<Badge>,
    pub comment_priority: bool,
    pub extra_posts_per_period: u32,
    pub extra_comments_per_period: u32,
}

impl Privileges {
    pub fn allowance(&self, action: PermissionAction) -> u32 {
        match action {
            PermissionAction::ExtraPost => self.extra_posts_per_period,
            PermissionAction::ExtraComment => self.extra_comments_per_period,
        }
    }
}

/// Result of recording one interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionOutcome {
    pub points_awarded: i64,
    pub relation_updated: bool,
    /// Badges of tiers crossed by this interaction
    pub newly_unlocked_badges: Vec<Badge>,
    pub relation: Option<BestFriendRelation>,
}

impl InteractionOutcome {
    pub fn unchanged() -> Self {
        Self {
            points_awarded: 0,
            relation_updated: false,
            newly_unlocked_badges: Vec::new(),
            relation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub action: PermissionAction,
    pub allowance: u32,
    pub used: u32,
    pub remaining: u32,
}

/// Read model of one relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationStats {
    pub relation_id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub status: RelationStatus,
    pub tier: RelationshipTier,
    pub user1_points: i64,
    pub user2_points: i64,
    pub total_points: i64,
    pub age_days: f64,
    pub days_since_last_interaction: f64,
    pub next_tier: Option<RelationshipTier>,
    /// None at BEST; Some(0) when only the age requirement is missing
    pub points_to_next_tier: Option<i64>,
    pub privileges: Privileges,
    pub quota: Vec<QuotaUsage>,
}

/// Look up a relation either by id or by its two members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationRef {
    Id(Uuid),
    Pair(Uuid, Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(PairKey::new(a, b).unwrap(), PairKey::new(b, a).unwrap());
        let pair = PairKey::new(a, b).unwrap();
        assert!(pair.user1_id < pair.user2_id);
        assert_eq!(pair.other(a), Some(b));
        assert_eq!(pair.other(Uuid::new_v4()), None);
    }

    #[test]
    fn test_pair_key_rejects_self_pair() {
        let a = Uuid::new_v4();
        assert!(matches!(PairKey::new(a, a), Err(EngagementError::Validation(_))));
    }

    #[test]
    fn test_tiers_are_ordered() {
        assert!(RelationshipTier::New < RelationshipTier::Growing);
        assert!(RelationshipTier::Growing < RelationshipTier::Strong);
        assert!(RelationshipTier::Strong < RelationshipTier::Best);
        assert_eq!(RelationshipTier::Best.next(), None);
    }

    #[test]
    fn test_add_points_keeps_total() {
        let pair = PairKey::new(Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let mut relation = BestFriendRelation::new(pair, Utc::now());
        relation.add_points(Side::User1, 7);
        relation.add_points(Side::User2, 5);
        relation.add_points(Side::User1, 2);
        assert_eq!(relation.total_points, 14);
        assert_eq!(relation.user1_points + relation.user2_points, relation.total_points);
    }

    #[test]
    fn test_unknown_interaction_type_rejected() {
        assert!("poke".parse::<InteractionType>().is_err());
        assert_eq!("reply".parse::<InteractionType>().unwrap(), InteractionType::Reply);
    }
}
