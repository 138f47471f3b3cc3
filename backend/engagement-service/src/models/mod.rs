pub mod health;
pub mod interest;
pub mod post;
pub mod relationship;
pub mod social;
pub mod video;

pub use health::{HealthStatus, JobRunRecord, PerformanceMetrics, Subsystem};
pub use interest::{ContentCluster, EngagementKind, InteractionEvent, InterestScore, ScrollEvent};
pub use post::{EngagementCounts, PostAttractivenessScore};
pub use relationship::{
    Badge, BestFriendRelation, InteractionMetadata, InteractionOutcome, InteractionType,
    PairKey, PairwiseInteraction, PermissionAction, PermissionRequest, PermissionStatus,
    Privileges, QuotaUsage, RelationRef, RelationStats, RelationStatus, RelationshipTier, Side,
};
pub use social::FollowSuggestion;
pub use video::{VideoMetrics, VideoWatchSession};
