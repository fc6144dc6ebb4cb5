use crate::error::{AppError, Result};
use crate::models::StrategyKind;
use crate::services::blending::BlendConfig;
use crate::services::experiment::{ExperimentCatalog, ExperimentConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Environment variable naming an optional config file (TOML, YAML or JSON).
pub const CONFIG_FILE_ENV: &str = "RECOMMENDATION_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub artifacts: ArtifactConfig,
    pub catalog: CatalogConfig,
    pub cache: CacheConfig,
    pub scoring: ScoringConfig,
    pub cold_start: ColdStartConfig,
    pub blending: BlendingConfig,
    pub experiments: Vec<ExperimentConfig>,
    pub outcomes: OutcomeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub http_host: String,
    pub http_port: u16,
    pub service_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 8012,
            service_name: "recommendation-service".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Root of the `<kind>/v<N>.json` artifact tree.
    pub root_dir: String,
    pub refresh_interval_secs: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root_dir: "./artifacts".to_string(),
            refresh_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// JSON snapshot of user/item attributes and interaction counts.
    pub snapshot_path: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            snapshot_path: "./catalog.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: u64,
    pub ttl_secs: u64,
    /// TTL for "not found" answers from the attribute store.
    pub negative_ttl_secs: u64,
    pub maintenance_interval_secs: u64,
    pub fetch_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: 300,
            negative_ttl_secs: 30,
            maintenance_interval_secs: 30,
            fetch_timeout_ms: 25,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Whole-request budget, set when the request is received.
    pub request_timeout_ms: u64,
    pub strategy_timeout_ms: u64,
    /// Per-strategy overrides of `strategy_timeout_ms`.
    pub strategy_timeouts: BTreeMap<StrategyKind, u64>,
    /// How long a strategy may take to hand back partial scores after its deadline.
    pub cancel_grace_ms: u64,
    /// Upper bound on the pool size when the request asks for "all".
    pub max_candidates: usize,
    pub max_list_length: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 80,
            strategy_timeout_ms: 40,
            strategy_timeouts: BTreeMap::new(),
            cancel_grace_ms: 5,
            max_candidates: 500,
            max_list_length: 200,
        }
    }
}

impl ScoringConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn strategy_timeout(&self, strategy: StrategyKind) -> Duration {
        let millis = self
            .strategy_timeouts
            .get(&strategy)
            .copied()
            .unwrap_or(self.strategy_timeout_ms);
        Duration::from_millis(millis)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColdStartConfig {
    pub min_user_interactions: u64,
    pub min_item_exposures: u64,
    /// Strategies that remain the sole contributors for a cold candidate.
    pub fallback_strategies: Vec<StrategyKind>,
    pub lookup_timeout_ms: u64,
}

impl Default for ColdStartConfig {
    fn default() -> Self {
        Self {
            min_user_interactions: 5,
            min_item_exposures: 20,
            fallback_strategies: vec![StrategyKind::Popularity, StrategyKind::ContentBased],
            lookup_timeout_ms: 10,
        }
    }
}

impl ColdStartConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlendingConfig {
    /// Blend used when a request is not part of any known experiment.
    pub default_blend: String,
    pub blends: BTreeMap<String, BlendConfig>,
}

impl Default for BlendingConfig {
    fn default() -> Self {
        let mut blends = BTreeMap::new();
        blends.insert("default".to_string(), BlendConfig::default());

        Self {
            default_blend: "default".to_string(),
            blends,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutcomeConfig {
    pub channel_capacity: usize,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file named by
    /// `RECOMMENDATION_CONFIG`, and `APP__SECTION__KEY` environment overrides.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Reject invalid settings at load time so they never surface mid-request.
    pub fn validate(&self) -> Result<()> {
        if self.service.http_port == 0 {
            return Err(AppError::Configuration(
                "HTTP port must be greater than 0".to_string(),
            ));
        }

        if self.cache.capacity == 0 {
            return Err(AppError::Configuration(
                "Feature cache capacity must be greater than 0".to_string(),
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(AppError::Configuration(
                "Feature cache TTL must be greater than 0".to_string(),
            ));
        }

        if self.scoring.request_timeout_ms == 0 || self.scoring.strategy_timeout_ms == 0 {
            return Err(AppError::Configuration(
                "Request and strategy timeouts must be greater than 0".to_string(),
            ));
        }

        if self.scoring.max_candidates == 0 || self.scoring.max_list_length == 0 {
            return Err(AppError::Configuration(
                "max_candidates and max_list_length must be greater than 0".to_string(),
            ));
        }

        if self.cold_start.fallback_strategies.is_empty() {
            return Err(AppError::Configuration(
                "Cold start needs at least one fallback strategy".to_string(),
            ));
        }

        if self.outcomes.channel_capacity == 0 {
            return Err(AppError::Configuration(
                "Outcome channel capacity must be greater than 0".to_string(),
            ));
        }

        for (name, blend) in &self.blending.blends {
            blend.validate(name)?;
        }

        // Compiling the catalog checks bucket ranges and blend references.
        ExperimentCatalog::compile(&self.blending, &self.experiments)?;

        Ok(())
    }
}
