/// Configuration management for Engagement Service
///
/// Loads configuration from environment variables. Every decay constant,
/// threshold and tier boundary lives here as a named value.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::models::EngagementKind;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub decay: DecayConfig,
    pub clustering: ClusteringConfig,
    pub scroll: ScrollConfig,
    pub video_metrics: VideoMetricsConfig,
    pub attractiveness: AttractivenessConfig,
    pub suggestions: SuggestionConfig,
    pub relationship: RelationshipConfig,
    pub scheduler: SchedulerConfig,
    pub health: HealthConfig,
    pub store_retry: StoreRetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    /// Application environment (development, staging, production)
    pub env: String,
    /// `json` or `pretty`
    pub log_format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "engagement-service".to_string(),
            env: "development".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    /// Required when backend is postgres
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Postgres,
            url: None,
            max_connections: 20,
            min_connections: 5,
            run_migrations: true,
        }
    }
}

/// Interest decay constants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    /// Half-life of an unreinforced interest, in days. λ = ln 2 / half_life_days
    pub half_life_days: f64,
    /// Non-archived scores whose decayed value drops below this are archived
    pub archive_threshold: f64,
    /// Archived scores below this floor are deleted after the grace period
    pub delete_threshold: f64,
    /// Days an entry must stay archived before it may be deleted
    pub deletion_grace_days: i64,
    /// Users recomputed concurrently during a pass
    pub worker_concurrency: usize,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            half_life_days: 14.0,
            archive_threshold: 0.5,
            delete_threshold: 0.05,
            deletion_grace_days: 30,
            worker_concurrency: 8,
        }
    }
}

impl DecayConfig {
    pub fn lambda(&self) -> f64 {
        std::f64::consts::LN_2 / self.half_life_days
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Interaction events older than this are ignored for co-occurrence
    pub lookback_days: i64,
    /// Two topics are linked when seen together on at least this many events
    pub min_cooccurrence: u32,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            min_cooccurrence: 2,
        }
    }
}

/// When a scroll event counts as interest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollConfig {
    pub min_scroll_depth: f64,
    pub min_dwell_ms: u64,
    pub scroll_weight: f64,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            min_scroll_depth: 0.75,
            min_dwell_ms: 3_000,
            scroll_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoMetricsConfig {
    /// Only posts with sessions newer than this are swept
    pub active_window_hours: i64,
    pub max_posts_per_cycle: usize,
    pub worker_concurrency: usize,
}

impl Default for VideoMetricsConfig {
    fn default() -> Self {
        Self {
            active_window_hours: 24,
            max_posts_per_cycle: 500,
            worker_concurrency: 8,
        }
    }
}

/// Weight table for the attractiveness score. Ordering share > save >
/// comment > like > clicks > view is part of the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementWeights {
    pub view: f64,
    pub like: f64,
    pub comment: f64,
    pub share: f64,
    pub save: f64,
    pub profile_click: f64,
    pub hashtag_click: f64,
}

impl Default for EngagementWeights {
    fn default() -> Self {
        Self {
            view: 1.0,
            like: 3.0,
            comment: 5.0,
            share: 8.0,
            save: 6.0,
            profile_click: 2.0,
            hashtag_click: 2.0,
        }
    }
}

impl EngagementWeights {
    pub fn weight(&self, kind: EngagementKind) -> f64 {
        match kind {
            EngagementKind::View => self.view,
            EngagementKind::Like => self.like,
            EngagementKind::Comment => self.comment,
            EngagementKind::Share => self.share,
            EngagementKind::Save => self.save,
            EngagementKind::ProfileClick => self.profile_click,
            EngagementKind::HashtagClick => self.hashtag_click,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttractivenessConfig {
    pub weights: EngagementWeights,
    /// Age at which a post needs twice the engagement for the same score
    pub age_scale_hours: f64,
    /// Bumped whenever the weight table changes
    pub weights_version: i32,
    pub active_window_hours: i64,
    pub max_posts_per_cycle: usize,
    pub worker_concurrency: usize,
}

impl Default for AttractivenessConfig {
    fn default() -> Self {
        Self {
            weights: EngagementWeights::default(),
            age_scale_hours: 24.0,
            weights_version: 1,
            active_window_hours: 24,
            max_posts_per_cycle: 500,
            worker_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionConfig {
    pub interest_weight: f64,
    pub mutual_weight: f64,
    pub recency_weight: f64,
    /// Recency signal halves every this many days of inactivity
    pub recency_half_life_days: f64,
    /// Activity window for "recently active" candidates and batch targets
    pub active_days: i64,
    /// Cap on recently-active users pulled into one candidate pool
    pub recent_pool_size: usize,
    /// Users refreshed per pass
    pub batch_size: usize,
    pub suggestions_per_user: usize,
    pub worker_concurrency: usize,
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            interest_weight: 3.0,
            mutual_weight: 2.0,
            recency_weight: 1.0,
            recency_half_life_days: 7.0,
            active_days: 7,
            recent_pool_size: 200,
            batch_size: 200,
            suggestions_per_user: 20,
            worker_concurrency: 8,
        }
    }
}

/// Best-friend tier boundaries, activation and quota rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipConfig {
    pub growing_points: i64,
    pub strong_points: i64,
    pub best_points: i64,
    /// BEST also requires the relation to be at least this old
    pub best_min_age_days: i64,
    /// min(A→B, B→A) interactions within the window needed to activate
    pub activation_threshold: u32,
    pub activation_window_days: i64,
    /// PENDING/ACTIVE relations idle longer than this are ended
    pub inactivity_limit_days: i64,
    pub quota_period_days: i64,
    /// REQUESTED permissions older than this expire
    pub request_ttl_hours: i64,
    /// Optimistic-lock retries for one interaction
    pub max_conflict_retries: u32,
    /// Relations and requests handled concurrently by maintenance
    pub worker_concurrency: usize,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            growing_points: 50,
            strong_points: 200,
            best_points: 500,
            best_min_age_days: 30,
            activation_threshold: 3,
            activation_window_days: 7,
            inactivity_limit_days: 30,
            quota_period_days: 7,
            request_ttl_hours: 48,
            max_conflict_retries: 5,
            worker_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub interest_interval_secs: u64,
    pub video_metrics_interval_secs: u64,
    pub attractiveness_interval_secs: u64,
    pub suggestions_interval_secs: u64,
    pub relationship_interval_secs: u64,
    /// Run every job once immediately at start instead of after one interval
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interest_interval_secs: 6 * 3600,
            video_metrics_interval_secs: 3600,
            attractiveness_interval_secs: 3600,
            suggestions_interval_secs: 12 * 3600,
            relationship_interval_secs: 3600,
            run_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// success rate strictly above this is HEALTHY
    pub healthy_success_rate: f64,
    /// success rate strictly above this (and not healthy) is WARNING
    pub warning_success_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            healthy_success_rate: 0.9,
            warning_success_rate: 0.7,
        }
    }
}

/// Backoff for single-entity store calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl StoreRetryConfig {
    pub fn to_retry_config(&self) -> resilience::RetryConfig {
        resilience::RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            ..Default::default()
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let service_defaults = ServiceConfig::default();
        let service = ServiceConfig {
            service_name: env_or("SERVICE_NAME", service_defaults.service_name),
            env: env_or("APP_ENV", service_defaults.env),
            log_format: env_or("LOG_FORMAT", service_defaults.log_format),
        };

        let db = DatabaseConfig::default();
        let backend: StorageBackend = match std::env::var("STORAGE_BACKEND") {
            Ok(raw) => raw
                .parse()
                .map_err(anyhow::Error::msg)
                .context("STORAGE_BACKEND is invalid")?,
            Err(_) => db.backend,
        };
        let url = std::env::var("DATABASE_URL").ok();
        if backend == StorageBackend::Postgres && url.is_none() {
            anyhow::bail!("DATABASE_URL environment variable not set");
        }
        let database = DatabaseConfig {
            backend,
            url,
            max_connections: env_or("DB_MAX_CONNECTIONS", db.max_connections),
            min_connections: env_or("DB_MIN_CONNECTIONS", db.min_connections),
            run_migrations: env_or("DB_RUN_MIGRATIONS", db.run_migrations),
        };

        let d = DecayConfig::default();
        let decay = DecayConfig {
            half_life_days: env_or("INTEREST_HALF_LIFE_DAYS", d.half_life_days),
            archive_threshold: env_or("INTEREST_ARCHIVE_THRESHOLD", d.archive_threshold),
            delete_threshold: env_or("INTEREST_DELETE_THRESHOLD", d.delete_threshold),
            deletion_grace_days: env_or("INTEREST_DELETION_GRACE_DAYS", d.deletion_grace_days),
            worker_concurrency: env_or("INTEREST_WORKER_CONCURRENCY", d.worker_concurrency),
        };
        if !(decay.half_life_days > 0.0) {
            anyhow::bail!("INTEREST_HALF_LIFE_DAYS must be positive");
        }
        if decay.delete_threshold > decay.archive_threshold {
            anyhow::bail!("INTEREST_DELETE_THRESHOLD must not exceed INTEREST_ARCHIVE_THRESHOLD");
        }

        let c = ClusteringConfig::default();
        let clustering = ClusteringConfig {
            lookback_days: env_or("CLUSTER_LOOKBACK_DAYS", c.lookback_days),
            min_cooccurrence: env_or("CLUSTER_MIN_COOCCURRENCE", c.min_cooccurrence),
        };

        let s = ScrollConfig::default();
        let scroll = ScrollConfig {
            min_scroll_depth: env_or("SCROLL_MIN_DEPTH", s.min_scroll_depth),
            min_dwell_ms: env_or("SCROLL_MIN_DWELL_MS", s.min_dwell_ms),
            scroll_weight: env_or("SCROLL_WEIGHT", s.scroll_weight),
        };

        let v = VideoMetricsConfig::default();
        let video_metrics = VideoMetricsConfig {
            active_window_hours: env_or("VIDEO_ACTIVE_WINDOW_HOURS", v.active_window_hours),
            max_posts_per_cycle: env_or("VIDEO_MAX_POSTS_PER_CYCLE", v.max_posts_per_cycle),
            worker_concurrency: env_or("VIDEO_WORKER_CONCURRENCY", v.worker_concurrency),
        };

        let a = AttractivenessConfig::default();
        let attractiveness = AttractivenessConfig {
            weights: a.weights,
            age_scale_hours: env_or("ATTRACTIVENESS_AGE_SCALE_HOURS", a.age_scale_hours),
            weights_version: a.weights_version,
            active_window_hours: env_or(
                "ATTRACTIVENESS_ACTIVE_WINDOW_HOURS",
                a.active_window_hours,
            ),
            max_posts_per_cycle: env_or(
                "ATTRACTIVENESS_MAX_POSTS_PER_CYCLE",
                a.max_posts_per_cycle,
            ),
            worker_concurrency: env_or("ATTRACTIVENESS_WORKER_CONCURRENCY", a.worker_concurrency),
        };

        let g = SuggestionConfig::default();
        let suggestions = SuggestionConfig {
            interest_weight: env_or("SUGGEST_INTEREST_WEIGHT", g.interest_weight),
            mutual_weight: env_or("SUGGEST_MUTUAL_WEIGHT", g.mutual_weight),
            recency_weight: env_or("SUGGEST_RECENCY_WEIGHT", g.recency_weight),
            recency_half_life_days: env_or(
                "SUGGEST_RECENCY_HALF_LIFE_DAYS",
                g.recency_half_life_days,
            ),
            active_days: env_or("SUGGEST_ACTIVE_DAYS", g.active_days),
            recent_pool_size: env_or("SUGGEST_RECENT_POOL_SIZE", g.recent_pool_size),
            batch_size: env_or("SUGGEST_BATCH_SIZE", g.batch_size),
            suggestions_per_user: env_or("SUGGEST_PER_USER", g.suggestions_per_user),
            worker_concurrency: env_or("SUGGEST_WORKER_CONCURRENCY", g.worker_concurrency),
        };

        let r = RelationshipConfig::default();
        let relationship = RelationshipConfig {
            growing_points: env_or("BF_GROWING_POINTS", r.growing_points),
            strong_points: env_or("BF_STRONG_POINTS", r.strong_points),
            best_points: env_or("BF_BEST_POINTS", r.best_points),
            best_min_age_days: env_or("BF_BEST_MIN_AGE_DAYS", r.best_min_age_days),
            activation_threshold: env_or("BF_ACTIVATION_THRESHOLD", r.activation_threshold),
            activation_window_days: env_or("BF_ACTIVATION_WINDOW_DAYS", r.activation_window_days),
            inactivity_limit_days: env_or("BF_INACTIVITY_LIMIT_DAYS", r.inactivity_limit_days),
            quota_period_days: env_or("BF_QUOTA_PERIOD_DAYS", r.quota_period_days),
            request_ttl_hours: env_or("BF_REQUEST_TTL_HOURS", r.request_ttl_hours),
            max_conflict_retries: env_or("BF_MAX_CONFLICT_RETRIES", r.max_conflict_retries),
            worker_concurrency: env_or("BF_WORKER_CONCURRENCY", r.worker_concurrency),
        };
        if !(relationship.growing_points < relationship.strong_points
            && relationship.strong_points < relationship.best_points)
        {
            anyhow::bail!("tier boundaries must be strictly increasing");
        }
        if relationship.quota_period_days <= 0 {
            anyhow::bail!("BF_QUOTA_PERIOD_DAYS must be positive");
        }

        let sc = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            interest_interval_secs: env_or("JOB_INTEREST_INTERVAL_SECS", sc.interest_interval_secs),
            video_metrics_interval_secs: env_or(
                "JOB_VIDEO_METRICS_INTERVAL_SECS",
                sc.video_metrics_interval_secs,
            ),
            attractiveness_interval_secs: env_or(
                "JOB_ATTRACTIVENESS_INTERVAL_SECS",
                sc.attractiveness_interval_secs,
            ),
            suggestions_interval_secs: env_or(
                "JOB_SUGGESTIONS_INTERVAL_SECS",
                sc.suggestions_interval_secs,
            ),
            relationship_interval_secs: env_or(
                "JOB_RELATIONSHIP_INTERVAL_SECS",
                sc.relationship_interval_secs,
            ),
            run_on_start: env_or("JOB_RUN_ON_START", sc.run_on_start),
        };

        let h = HealthConfig::default();
        let health = HealthConfig {
            healthy_success_rate: env_or("HEALTH_HEALTHY_SUCCESS_RATE", h.healthy_success_rate),
            warning_success_rate: env_or("HEALTH_WARNING_SUCCESS_RATE", h.warning_success_rate),
        };

        let sr = StoreRetryConfig::default();
        let store_retry = StoreRetryConfig {
            max_retries: env_or("STORE_MAX_RETRIES", sr.max_retries),
            initial_backoff_ms: env_or("STORE_INITIAL_BACKOFF_MS", sr.initial_backoff_ms),
            max_backoff_ms: env_or("STORE_MAX_BACKOFF_MS", sr.max_backoff_ms),
        };

        Ok(Config {
            service,
            database,
            decay,
            clustering,
            scroll,
            video_metrics,
            attractiveness,
            suggestions,
            relationship,
            scheduler,
            health,
            store_retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        std::env::set_var("STORAGE_BACKEND", "memory");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.decay.half_life_days, 14.0);
        assert_eq!(config.relationship.strong_points, 200);
        assert_eq!(config.scheduler.video_metrics_interval_secs, 3600);
        assert_eq!(config.health.healthy_success_rate, 0.9);
    }

    #[test]
    fn test_lambda_from_half_life() {
        let decay = DecayConfig {
            half_life_days: 1.0,
            ..Default::default()
        };
        assert!((decay.lambda() - std::f64::consts::LN_2).abs() < 1e-12);
    }

    #[test]
    fn test_weight_table_ordering() {
        let w = EngagementWeights::default();
        assert!(w.share > w.comment);
        assert!(w.comment > w.like);
        assert!(w.like > w.view);
    }

    #[test]
    fn test_storage_backend_parse() {
        assert_eq!("Postgres".parse::<StorageBackend>(), Ok(StorageBackend::Postgres));
        assert_eq!("memory".parse::<StorageBackend>(), Ok(StorageBackend::Memory));
        assert!("mysql".parse::<StorageBackend>().is_err());
    }
}
