//! Scheduled adapters around the engines

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::EngineJob;
use crate::error::Result;
use crate::models::Subsystem;
use crate::services::{
    AttractivenessScorer, BatchReport, BestFriendEngine, FollowSuggestionGenerator,
    InterestDecayEngine, VideoMetricsAggregator,
};

/// Decay pass followed by a clustering pass
pub struct InterestMaintenanceJob {
    engine: Arc<InterestDecayEngine>,
    interval: Duration,
}

impl InterestMaintenanceJob {
    pub fn new(engine: Arc<InterestDecayEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }
}

#[async_trait]
impl EngineJob for InterestMaintenanceJob {
    fn subsystem(&self) -> Subsystem {
        Subsystem::InterestDecay
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<BatchReport> {
        let decayed = self.engine.run_decay_pass().await?;
        let clustered = self.engine.run_clustering_pass().await?;
        Ok(decayed.merge(clustered))
    }
}

pub struct VideoMetricsJob {
    aggregator: Arc<VideoMetricsAggregator>,
    interval: Duration,
}

impl VideoMetricsJob {
    pub fn new(aggregator: Arc<VideoMetricsAggregator>, interval: Duration) -> Self {
        Self {
            aggregator,
            interval,
        }
    }
}

#[async_trait]
impl EngineJob for VideoMetricsJob {
    fn subsystem(&self) -> Subsystem {
        Subsystem::VideoMetrics
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<BatchReport> {
        self.aggregator.run_metrics_sweep().await
    }
}

pub struct AttractivenessJob {
    scorer: Arc<AttractivenessScorer>,
    interval: Duration,
}

impl AttractivenessJob {
    pub fn new(scorer: Arc<AttractivenessScorer>, interval: Duration) -> Self {
        Self { scorer, interval }
    }
}

#[async_trait]
impl EngineJob for AttractivenessJob {
    fn subsystem(&self) -> Subsystem {
        Subsystem::PostAttractiveness
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<BatchReport> {
        self.scorer.run_scoring_sweep().await
    }
}

pub struct SuggestionJob {
    generator: Arc<FollowSuggestionGenerator>,
    interval: Duration,
}

impl SuggestionJob {
    pub fn new(generator: Arc<FollowSuggestionGenerator>, interval: Duration) -> Self {
        Self {
            generator,
            interval,
        }
    }
}

#[async_trait]
impl EngineJob for SuggestionJob {
    fn subsystem(&self) -> Subsystem {
        Subsystem::FollowSuggestions
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<BatchReport> {
        self.generator.run_suggestion_pass().await
    }
}

pub struct RelationshipMaintenanceJob {
    engine: Arc<BestFriendEngine>,
    interval: Duration,
}

impl RelationshipMaintenanceJob {
    pub fn new(engine: Arc<BestFriendEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }
}

#[async_trait]
impl EngineJob for RelationshipMaintenanceJob {
    fn subsystem(&self) -> Subsystem {
        Subsystem::RelationshipMaintenance
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<BatchReport> {
        self.engine.run_maintenance().await
    }
}
