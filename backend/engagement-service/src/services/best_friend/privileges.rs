//! Tier derivation, privilege table and quota periods

use chrono::{DateTime, TimeZone, Utc};

use crate::config::RelationshipConfig;
use crate::models::{Badge, Privileges, RelationshipTier};

/// Tier for a point total. BEST additionally needs a minimum relation age.
pub fn tier_for(total_points: i64, age_days: f64, config: &RelationshipConfig) -> RelationshipTier {
    if total_points >= config.best_points && age_days >= config.best_min_age_days as f64 {
        RelationshipTier::Best
    } else if total_points >= config.strong_points {
        RelationshipTier::Strong
    } else if total_points >= config.growing_points {
        RelationshipTier::Growing
    } else {
        RelationshipTier::New
    }
}

/// Points a relation needs to enter `tier`
pub fn tier_threshold(tier: RelationshipTier, config: &RelationshipConfig) -> i64 {
    match tier {
        RelationshipTier::New => 0,
        RelationshipTier::Growing => config.growing_points,
        RelationshipTier::Strong => config.strong_points,
        RelationshipTier::Best => config.best_points,
    }
}

/// Fixed privilege table, never stored
pub fn privileges_for(tier: RelationshipTier) -> Privileges {
    let (comment_priority, extra_posts_per_period, extra_comments_per_period) = match tier {
        RelationshipTier::New => (false, 0, 0),
        RelationshipTier::Growing => (false, 0, 3),
        RelationshipTier::Strong => (true, 1, 10),
        RelationshipTier::Best => (true, 3, 25),
    };
    Privileges {
        tier,
        badge: tier.badge(),
        comment_priority,
        extra_posts_per_period,
        extra_comments_per_period,
    }
}

/// Badges of every tier in `(from, to]`
pub fn badges_unlocked(from: RelationshipTier, to: RelationshipTier) -> Vec<Badge> {
    RelationshipTier::ALL
        .iter()
        .filter(|tier| **tier > from && **tier <= to)
        .filter_map(|tier| tier.badge())
        .collect()
}

/// Start of the quota period containing `now`. Periods are aligned to the
/// Unix epoch so every instance agrees on the boundaries.
pub fn quota_period_start(now: DateTime<Utc>, period_days: i64) -> DateTime<Utc> {
    let period_secs = period_days.max(1) * 86_400;
    let secs = now.timestamp();
    let start = secs - secs.rem_euclid(period_secs);
    Utc.timestamp_opt(start, 0).single().unwrap_or(now)
}
