//! Engagement scoring and relationship engine
//!
//! Keeps derived engagement state fresh:
//! - time-decayed per-topic interests and topic clusters
//! - per-post video watch metrics
//! - normalized post attractiveness scores
//! - ranked follow suggestions
//! - best-friend relations with tiers, badges and permission quotas
//!
//! [`EngagementEngine`] exposes the operations; [`jobs::Scheduler`] runs the
//! periodic passes and records their health.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod notifier;
pub mod repository;
pub mod services;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::EngagementEngine;
pub use error::{EngagementError, Result};
