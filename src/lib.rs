//! Stage-aware LLM routing gateway, as a library.
//!
//! Re-exports every module the binary wires together, so integration
//! tests can exercise the request pipeline without spawning the server.

pub mod auth;
pub mod breaker;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod error;
pub mod log_pipeline;
pub mod orchestrator;
pub mod quota;
pub mod routing;
pub mod types;
pub mod upstream;

#[cfg(test)]
mod tests {
    use crate::config::{
        CircuitBreakerConfig, Config, DatabaseConfig, DirectConfig, LogPipelineConfig,
        RateLimitConfig, StageBinding, UpstreamConfig,
    };
    use crate::routing::{route, RouteRequest};
    use crate::types::{ChatMessage, Stage};
    use std::collections::HashMap;

    fn test_config() -> Config {
        let mut stages = HashMap::new();
        stages.insert(
            "plan".to_string(),
            StageBinding { model: "gpt-4o".into(), max_tokens: 2000, temperature: 0.3, fallback: vec![] },
        );
        Config {
            bind_address: "0.0.0.0:0".into(),
            json_limit: 1024,
            allowed_origins: vec![],
            stages,
            direct: DirectConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            database: DatabaseConfig { url: None, min_connections: 1, max_connections: 1 },
            upstream: UpstreamConfig {
                base_url: "http://localhost:4000".into(),
                api_key: None,
                timeout_secs: 60,
                connect_timeout_secs: 10,
                pool_max_idle_per_host: 4,
                pool_idle_timeout_secs: 10,
                max_retries: 2,
            },
            log_pipeline: LogPipelineConfig::default(),
            key_salt: "salt".into(),
            debug: true,
            version: "test".into(),
        }
    }

    /// Exercises configuration loading and the stage router together, the
    /// way the binary composes them before ever touching the network.
    #[test]
    fn routing_resolves_against_a_loaded_config_shape() {
        let config = test_config();
        let messages = vec![ChatMessage { role: "user".into(), content: "outline a plan".into() }];
        let req = RouteRequest {
            stage_hint: None,
            requested_model: None,
            requested_max_tokens: None,
            messages: &messages,
        };
        let decision = route(&config, &req).unwrap();
        assert_eq!(decision.stage, Stage::Plan);
        assert_eq!(decision.model, "gpt-4o");
    }
}
