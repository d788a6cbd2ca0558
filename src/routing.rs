//! Stage router: classifies a request to a concrete model and generation
//! parameters.
//!
//! `route` is a pure function of `(&Config, &RouteRequest)` — same inputs,
//! same decision, every time. It never performs I/O or touches the clock.

use crate::config::Config;
use crate::types::{ChatMessage, RoutingDecision, Stage};

const REVIEW_KEYWORDS: &[&str] =
    &["review", "audit", "critique", "pr ", "pull request", "feedback on"];
const CODE_KEYWORDS: &[&str] =
    &["implement", "write a function", "fix this bug", "refactor", "write code", "debug"];
const PLAN_KEYWORDS: &[&str] =
    &["plan", "design", "architecture", "outline", "roadmap", "approach"];
const INTERROGATIVES: &[&str] = &["what", "why", "how", "should", "when", "where", "which"];

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RouteError(pub String);

/// Everything the router needs to classify one request.
pub struct RouteRequest<'a> {
    pub stage_hint: Option<&'a str>,
    pub requested_model: Option<&'a str>,
    pub requested_max_tokens: Option<u32>,
    pub messages: &'a [ChatMessage],
}

/// Decide the stage, model, and generation parameters for one request.
pub fn route(config: &Config, req: &RouteRequest) -> Result<RoutingDecision, RouteError> {
    if let Some(hint) = req.stage_hint {
        if hint.eq_ignore_ascii_case("direct") {
            return route_direct(config, req);
        }
        if let Some(stage) = Stage::parse(hint) {
            return Ok(route_bound(config, stage, req, false));
        }
        return Err(RouteError(format!("unknown stage '{hint}'")));
    }

    let stage = infer_stage(req.messages);
    Ok(route_bound(config, stage, req, true))
}

fn route_direct(config: &Config, req: &RouteRequest) -> Result<RoutingDecision, RouteError> {
    let model = req
        .requested_model
        .ok_or_else(|| RouteError("direct mode requires a model".to_string()))?;

    if !config.direct.allowed_models.iter().any(|m| m == model) {
        let allowed = config.direct.allowed_models.join(", ");
        return Err(RouteError(format!(
            "Model '{model}' is not allowed in direct mode. Allowed models: {allowed}."
        )));
    }

    let cap = config.direct.max_tokens_cap;
    let effective_max_tokens = req.requested_max_tokens.unwrap_or(cap).min(cap);

    Ok(RoutingDecision {
        stage: Stage::Direct,
        model: model.to_string(),
        effective_max_tokens,
        temperature: 0.3,
        inferred: false,
    })
}

fn route_bound(config: &Config, stage: Stage, req: &RouteRequest, inferred: bool) -> RoutingDecision {
    let binding = config.binding(stage.as_str());
    let (model, cap, temperature) = match binding {
        Some(b) => (b.model.clone(), b.max_tokens, b.temperature),
        None => (stage.as_str().to_string(), 4096, 0.3),
    };

    let effective_max_tokens = match req.requested_max_tokens {
        Some(requested) => requested.min(cap),
        None => cap,
    };

    RoutingDecision {
        stage,
        model,
        effective_max_tokens,
        temperature,
        inferred,
    }
}

/// Infer a stage from the last user message, per the keyword matching
/// order `review` → `code` → `plan`, falling back to structural cues and
/// finally defaulting to `plan`.
fn infer_stage(messages: &[ChatMessage]) -> Stage {
    let Some(last_user) = messages.iter().rev().find(|m| m.role == "user") else {
        return Stage::Plan;
    };
    let content = last_user.content.to_lowercase();

    if REVIEW_KEYWORDS.iter().any(|kw| content.contains(kw)) {
        return Stage::Review;
    }
    if CODE_KEYWORDS.iter().any(|kw| content.contains(kw)) {
        return Stage::Code;
    }
    if PLAN_KEYWORDS.iter().any(|kw| content.contains(kw)) {
        return Stage::Plan;
    }

    if content.contains("```") || content.contains("def ") {
        return Stage::Code;
    }
    if INTERROGATIVES.iter().any(|w| content.trim_start().starts_with(w)) {
        return Stage::Plan;
    }

    Stage::Plan
}
