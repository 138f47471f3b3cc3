//! Points awarded for one pairwise interaction
//!
//! points = round(base × speed × reciprocity × topical × time_of_day)

use crate::error::{EngagementError, Result};
use crate::models::{InteractionMetadata, InteractionType};

const QUICK_REACTION_SECS: i64 = 5 * 60;
const PROMPT_REACTION_SECS: i64 = 60 * 60;

fn speed_multiplier(reaction_delay_secs: Option<i64>) -> f64 {
    match reaction_delay_secs {
        Some(d) if d < QUICK_REACTION_SECS => 1.5,
        Some(d) if d < PROMPT_REACTION_SECS => 1.2,
        _ => 1.0,
    }
}

fn reciprocity_multiplier(is_reciprocal: bool) -> f64 {
    if is_reciprocal {
        1.3
    } else {
        1.0
    }
}

fn topical_multiplier(topic_similarity: Option<f64>) -> f64 {
    1.0 + 0.5 * topic_similarity.unwrap_or(0.0)
}

/// Late night runs from 22:00 to 05:59 local time
fn time_of_day_multiplier(local_hour: Option<u32>) -> f64 {
    match local_hour {
        Some(h) if h >= 22 || h < 6 => 1.1,
        _ => 1.0,
    }
}

pub fn validate_metadata(metadata: &InteractionMetadata) -> Result<()> {
    if let Some(delay) = metadata.reaction_delay_secs {
        if delay < 0 {
            return Err(EngagementError::validation(format!(
                "reaction_delay_secs must not be negative, got {}",
                delay
            )));
        }
    }
    if let Some(sim) = metadata.topic_similarity {
        if !(0.0..=1.0).contains(&sim) {
            return Err(EngagementError::validation(format!(
                "topic_similarity must be within 0..=1, got {}",
                sim
            )));
        }
    }
    if let Some(hour) = metadata.local_hour {
        if hour > 23 {
            return Err(EngagementError::validation(format!(
                "local_hour must be within 0..=23, got {}",
                hour
            )));
        }
    }
    Ok(())
}

pub fn interaction_points(kind: InteractionType, metadata: &InteractionMetadata) -> i64 {
    let points = kind.base_points()
        * speed_multiplier(metadata.reaction_delay_secs)
        * reciprocity_multiplier(metadata.is_reciprocal)
        * topical_multiplier(metadata.topic_similarity)
        * time_of_day_multiplier(metadata.local_hour);
    points.round() as i64
}
