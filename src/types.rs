//! Shared data types for the request-handling pipeline.
//!
//! Mirrors the OpenAI chat-completions wire schema where the gateway is a
//! pass-through, and defines the gateway-internal types (`Principal`,
//! `Stage`, `RoutingDecision`, `LogEntry`) that travel between components.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// The authenticated identity of a caller. Exists only if authentication
/// succeeded; lives for the duration of one request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub api_key_id: Option<i64>,
    pub key_prefix: String,
}

/// Coarse classification of a request to a model + generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Plan,
    Code,
    Review,
    Direct,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Code => "code",
            Stage::Review => "review",
            Stage::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "plan" => Some(Stage::Plan),
            "code" => Some(Stage::Code),
            "review" => Some(Stage::Review),
            "direct" => Some(Stage::Direct),
            _ => None,
        }
    }
}

/// Output of the stage router: the concrete model and parameters to send
/// upstream for this request.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub stage: Stage,
    pub model: String,
    pub effective_max_tokens: u32,
    pub temperature: f32,
    pub inferred: bool,
}

/// An immutable record of a completed request, enqueued into the async log
/// pipeline. `total_tokens` is always the sum of its two components.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: Option<i64>,
    pub stage: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost: Decimal,
    pub latency_ms: u64,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: String,
        user_id: String,
        api_key_id: Option<i64>,
        stage: String,
        model: String,
        prompt_tokens: u32,
        completion_tokens: u32,
        cost: Decimal,
        latency_ms: u64,
        status_code: u16,
        error_message: Option<String>,
    ) -> Self {
        Self {
            request_id,
            user_id,
            api_key_id,
            stage,
            model,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost,
            latency_ms,
            status_code,
            error_message,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------
// OpenAI-compatible wire schema
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// `stop` may arrive as a bare string or a list; normalized to a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequence {
    One(String),
    Many(Vec<String>),
}

impl StopSequence {
    pub fn into_list(self) -> Vec<String> {
        match self {
            StopSequence::One(s) => vec![s],
            StopSequence::Many(v) => v,
        }
    }
}

/// Incoming `/v1/chat/completions` body. Unknown fields are captured in
/// `extra` and passed through untouched on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    #[validate(range(min = 1, max = 128_000))]
    pub max_tokens: Option<u32>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub top_p: Option<f32>,
    #[validate(range(min = 1, max = 10))]
    pub n: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    pub stop: Option<StopSequence>,
    #[validate(range(min = -2.0, max = 2.0))]
    pub presence_penalty: Option<f32>,
    #[validate(range(min = -2.0, max = 2.0))]
    pub frequency_penalty: Option<f32>,
    pub logit_bias: Option<HashMap<String, f32>>,
    pub user: Option<String>,
    pub tools: Option<serde_json::Value>,
    pub tool_choice: Option<serde_json::Value>,
    pub response_format: Option<serde_json::Value>,
    pub seed: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Outbound payload sent to the upstream LLM proxy. Fields left unset on
/// the incoming request are omitted entirely from the serialized body.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompletionResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<serde_json::Value>,
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthState,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub checks: HashMap<String, bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_sequence_normalizes_to_list() {
        let one: StopSequence = serde_json::from_str("\"\\n\"").unwrap();
        assert_eq!(one.into_list(), vec!["\n".to_string()]);

        let many: StopSequence = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(many.into_list(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn stage_parse_roundtrips() {
        for s in ["plan", "code", "review", "direct"] {
            assert_eq!(Stage::parse(s).unwrap().as_str(), s);
        }
        assert!(Stage::parse("bogus").is_none());
    }

    #[test]
    fn log_entry_total_tokens_is_sum() {
        let entry = LogEntry::new(
            "cfx-abc".into(),
            "user-1".into(),
            None,
            "plan".into(),
            "gpt-4".into(),
            100,
            50,
            Decimal::ZERO,
            10,
            200,
            None,
        );
        assert_eq!(entry.total_tokens, 150);
    }

    #[test]
    fn upstream_request_omits_unset_optional_fields() {
        let req = UpstreamCompletionRequest {
            model: "gpt-4".into(),
            messages: vec![ChatMessage { role: "user".into(), content: "hi".into() }],
            max_tokens: None,
            temperature: None,
            top_p: None,
            n: None,
            stream: None,
            stop: None,
            presence_penalty: None,
            frequency_penalty: None,
            logit_bias: None,
            user: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            seed: None,
            extra: Default::default(),
        };
        let json = serde_json::to_value(&req).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("max_tokens"));
        assert!(!obj.contains_key("temperature"));
        assert_eq!(obj.get("model").unwrap(), "gpt-4");
    }
}
