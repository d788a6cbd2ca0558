//! Configuration Management Module
//!
//! Loads and validates all gateway configuration, layering (lowest to
//! highest priority):
//! 1. built-in defaults,
//! 2. an optional YAML file named by `CFX_CONFIG_PATH`,
//! 3. environment variables (including a `.env` file if present).
//!
//! The layering itself is delegated to the `config` crate; this module
//! owns the typed `Config` struct the layers deserialize into and the
//! handful of env-only settings (credentials, salts, timeouts) that never
//! belong in a checked-in YAML file.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Get environment variable value or fallback to default.
pub fn env_or(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

/// Parse boolean values from environment variables.
pub fn bool_env(key: &str, fallback: bool) -> bool {
    match env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") => true,
        Ok("0") | Ok("false") | Ok("FALSE") => false,
        _ => fallback,
    }
}

fn num_env<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(fallback)
}

/// Per-stage binding: the concrete model and generation defaults a stage
/// resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageBinding {
    pub model: String,
    #[serde(default = "default_stage_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_stage_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub fallback: Vec<String>,
}

fn default_stage_max_tokens() -> u32 {
    4096
}

fn default_stage_temperature() -> f32 {
    0.3
}

/// Settings governing `X-CFX-Stage: direct` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectConfig {
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_direct_cap")]
    pub max_tokens_cap: u32,
}

fn default_direct_cap() -> u32 {
    8192
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self { allowed_models: Vec::new(), max_tokens_cap: default_direct_cap() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_daily_requests")]
    pub daily_requests: u32,
    #[serde(default = "default_concurrent_streams")]
    pub concurrent_streams: u32,
}

fn default_daily_requests() -> u32 {
    1000
}

fn default_concurrent_streams() -> u32 {
    4
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            daily_requests: default_daily_requests(),
            concurrent_streams: default_concurrent_streams(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: f64,
    #[serde(default = "default_half_open_max")]
    pub half_open_max: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> f64 {
    30.0
}

fn default_half_open_max() -> u32 {
    1
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max: default_half_open_max(),
        }
    }
}

/// Durable store connection settings. Absent `DATABASE_URL` selects the
/// in-memory fallbacks for quota and auth (dev mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub min_connections: u32,
    pub max_connections: u32,
}

/// Upstream LLM proxy connection and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: u64,
    pub max_retries: u32,
}

/// Async log pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPipelineConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub retry_attempts: u32,
}

impl Default for LogPipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            flush_interval_ms: 2_000,
            retry_attempts: 3,
        }
    }
}

/// Top-level gateway configuration, fully resolved at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_address: String,
    pub json_limit: usize,
    pub allowed_origins: Vec<String>,

    pub stages: HashMap<String, StageBinding>,
    pub direct: DirectConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,

    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    pub log_pipeline: LogPipelineConfig,

    /// Salt mixed into `sha256(salt || ":" || token)` for key hashing.
    /// Accepts either `API_KEY_SALT` or `HASH_SALT`; the former wins.
    pub key_salt: String,
    pub debug: bool,
    pub version: String,
}

impl Config {
    /// Load configuration: defaults, then an optional YAML file named by
    /// `CFX_CONFIG_PATH`, then environment variables, highest priority last.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("json_limit", 8 * 1024 * 1024i64)?
            .set_default("direct.max_tokens_cap", default_direct_cap() as i64)?
            .set_default("rate_limit.daily_requests", default_daily_requests() as i64)?
            .set_default("rate_limit.concurrent_streams", default_concurrent_streams() as i64)?
            .set_default("circuit_breaker.failure_threshold", default_failure_threshold() as i64)?
            .set_default("circuit_breaker.recovery_timeout_secs", default_recovery_timeout_secs())?
            .set_default("circuit_breaker.half_open_max", default_half_open_max() as i64)?;

        if let Ok(path) = env::var("CFX_CONFIG_PATH") {
            builder = builder.add_source(config::File::with_name(&path).required(false));
        }

        let layered = builder.build()?;

        let stages: HashMap<String, StageBinding> = layered
            .get("stages")
            .unwrap_or_else(|_| default_stages());
        let direct: DirectConfig = layered.get("direct").unwrap_or_default();
        let rate_limit: RateLimitConfig = layered.get("rate_limit").unwrap_or_default();
        let circuit_breaker: CircuitBreakerConfig =
            layered.get("circuit_breaker").unwrap_or_default();
        let bind_address: String =
            layered.get("bind_address").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let json_limit: usize =
            layered.get::<i64>("json_limit").map(|v| v as usize).unwrap_or(8 * 1024 * 1024);

        let allowed_origins = parse_csv(env::var("ALLOWED_ORIGINS").ok().as_deref());

        let database_url = env::var("DATABASE_URL").ok();
        let database = DatabaseConfig {
            url: database_url,
            min_connections: num_env("DB_MIN_CONNECTIONS", 1),
            max_connections: num_env("DB_MAX_CONNECTIONS", 10),
        };

        let upstream = UpstreamConfig {
            base_url: env_or("LITELLM_URL", "http://localhost:4000"),
            api_key: env::var("LITELLM_API_KEY").ok(),
            timeout_secs: num_env("LITELLM_TIMEOUT", 60),
            connect_timeout_secs: num_env("LITELLM_CONNECT_TIMEOUT", 10),
            pool_max_idle_per_host: num_env("LITELLM_POOL_MAX_IDLE", 32),
            pool_idle_timeout_secs: num_env("LITELLM_POOL_IDLE_TIMEOUT", 90),
            max_retries: num_env("LITELLM_MAX_RETRIES", 2),
        };

        let key_salt = env::var("API_KEY_SALT")
            .or_else(|_| env::var("HASH_SALT"))
            .unwrap_or_else(|_| "cfx-dev-salt".to_string());

        Ok(Self {
            bind_address,
            json_limit,
            allowed_origins,
            stages,
            direct,
            rate_limit,
            circuit_breaker,
            database,
            upstream,
            log_pipeline: LogPipelineConfig::default(),
            key_salt,
            debug: bool_env("DEBUG", false),
            version: env_or("CFX_VERSION", env!("CARGO_PKG_VERSION")),
        })
    }

    pub fn binding(&self, stage: &str) -> Option<&StageBinding> {
        self.stages.get(stage)
    }
}

fn default_stages() -> HashMap<String, StageBinding> {
    let mut m = HashMap::new();
    m.insert(
        "plan".to_string(),
        StageBinding {
            model: env_or("CFX_STAGE_PLAN_MODEL", "gpt-4o"),
            max_tokens: default_stage_max_tokens(),
            temperature: default_stage_temperature(),
            fallback: Vec::new(),
        },
    );
    m.insert(
        "code".to_string(),
        StageBinding {
            model: env_or("CFX_STAGE_CODE_MODEL", "gpt-4o"),
            max_tokens: default_stage_max_tokens(),
            temperature: 0.2,
            fallback: Vec::new(),
        },
    );
    m.insert(
        "review".to_string(),
        StageBinding {
            model: env_or("CFX_STAGE_REVIEW_MODEL", "gpt-4o-mini"),
            max_tokens: default_stage_max_tokens(),
            temperature: 0.1,
            fallback: Vec::new(),
        },
    );
    m
}

/// Parse comma-separated values from environment variables.
pub fn parse_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
