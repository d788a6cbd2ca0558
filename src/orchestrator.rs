//! Request orchestrator: the one place that wires authentication, quota,
//! routing, the circuit breaker, the upstream client, and the log pipeline
//! together for a single `/v1/chat/completions` call.
//!
//! `complete` and `stream` share `admit` so the two response modes can
//! never diverge in how they spend quota or pick a route.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};

use crate::auth::Authenticator;
use crate::breaker::BreakerRegistry;
use crate::concurrency::{ConcurrencyLimiter, ConcurrencyPermit};
use crate::config::Config;
use crate::error::GatewayError;
use crate::log_pipeline::{self, LogPipeline, RequestIdGenerator};
use crate::quota::QuotaCounter;
use crate::routing::{self, RouteRequest};
use crate::types::{
    ChatCompletionRequest, CompletionResponse, LogEntry, Principal, RoutingDecision,
    UpstreamCompletionRequest,
};
use crate::upstream::UpstreamClient;

/// The caller's bearer header plus whatever stage override arrived via
/// `X-CFX-Stage`, alongside the already-deserialized body.
pub struct IncomingRequest<'a> {
    pub authorization: Option<&'a str>,
    pub stage_hint: Option<&'a str>,
    pub body: ChatCompletionRequest,
}

pub struct ChatResponse {
    pub request_id: String,
    pub decision: RoutingDecision,
    pub body: CompletionResponse,
    pub quota_limit: u32,
    pub remaining_quota: u32,
    pub quota_reset_at: DateTime<Utc>,
}

pub struct ChatStream {
    pub request_id: String,
    pub decision: RoutingDecision,
    pub quota_limit: u32,
    pub remaining_quota: u32,
    pub quota_reset_at: DateTime<Utc>,
    pub lines: Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    authenticator: Authenticator,
    quota: QuotaCounter,
    concurrency: ConcurrencyLimiter,
    breakers: BreakerRegistry,
    upstream: UpstreamClient,
    logs: LogPipeline,
    request_ids: Arc<RequestIdGenerator>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        authenticator: Authenticator,
        quota: QuotaCounter,
        concurrency: ConcurrencyLimiter,
        breakers: BreakerRegistry,
        upstream: UpstreamClient,
        logs: LogPipeline,
    ) -> Self {
        Self {
            config,
            authenticator,
            quota,
            concurrency,
            breakers,
            upstream,
            logs,
            request_ids: Arc::new(RequestIdGenerator::default()),
        }
    }

    /// Authenticate, spend one unit of daily quota, and resolve the route.
    /// Shared by both response modes. A quota denial still carries a
    /// principal and a request id, so it gets a best-effort denied-request
    /// log entry before the error propagates.
    async fn admit(
        &self,
        req: &IncomingRequest<'_>,
    ) -> Result<(Principal, RoutingDecision, String, u32, u32, DateTime<Utc>), GatewayError> {
        let started_at = Instant::now();
        let principal = self.authenticator.authenticate(req.authorization).await?;
        let request_id = self.request_ids.generate().await;

        let limit = self.config.rate_limit.daily_requests;
        let quota_status = self.quota.check_and_increment(&principal.user_id, limit).await;
        if !quota_status.allowed {
            let err = GatewayError::QuotaExceeded {
                limit,
                remaining: quota_status.remaining,
                reset_at: quota_status.reset_at,
            };
            self.log_denied(&principal, &request_id, started_at, &err);
            return Err(err);
        }

        let route_req = RouteRequest {
            stage_hint: req.stage_hint,
            requested_model: req.body.model.as_deref(),
            requested_max_tokens: req.body.max_tokens,
            messages: &req.body.messages,
        };
        let decision =
            routing::route(&self.config, &route_req).map_err(|e| GatewayError::InvalidRequest(e.0))?;

        Ok((principal, decision, request_id, limit, quota_status.remaining, quota_status.reset_at))
    }

    /// Best-effort log entry for a request denied before a route was ever
    /// resolved (currently: quota denial). No stage or model exists yet,
    /// so both are recorded as `"unknown"` and the entry carries zero
    /// tokens and zero cost.
    fn log_denied(&self, principal: &Principal, request_id: &str, started_at: Instant, err: &GatewayError) {
        let entry = LogEntry::new(
            request_id.to_string(),
            principal.user_id.clone(),
            principal.api_key_id,
            "unknown".to_string(),
            "unknown".to_string(),
            0,
            0,
            log_pipeline::compute_cost("unknown", 0, 0),
            started_at.elapsed().as_millis() as u64,
            err.status_code().as_u16(),
            Some(err.to_string()),
        );
        self.logs.enqueue(entry);
    }

    fn upstream_request(
        &self,
        body: &ChatCompletionRequest,
        decision: &RoutingDecision,
        stream: bool,
    ) -> UpstreamCompletionRequest {
        UpstreamCompletionRequest {
            model: decision.model.clone(),
            messages: body.messages.clone(),
            max_tokens: Some(decision.effective_max_tokens),
            temperature: Some(decision.temperature),
            top_p: body.top_p,
            n: body.n,
            stream: if stream { Some(true) } else { None },
            stop: body.stop.clone().map(|s| s.into_list()),
            presence_penalty: body.presence_penalty,
            frequency_penalty: body.frequency_penalty,
            logit_bias: body.logit_bias.clone(),
            user: body.user.clone(),
            tools: body.tools.clone(),
            tool_choice: body.tool_choice.clone(),
            response_format: body.response_format.clone(),
            seed: body.seed,
            extra: body.extra.clone(),
        }
    }

    fn log_failure(
        &self,
        principal: &Principal,
        decision: &RoutingDecision,
        request_id: &str,
        started_at: Instant,
        err: &GatewayError,
    ) {
        let cost = log_pipeline::compute_cost(&decision.model, 0, 0);
        let entry = LogEntry::new(
            request_id.to_string(),
            principal.user_id.clone(),
            principal.api_key_id,
            decision.stage.as_str().to_string(),
            decision.model.clone(),
            0,
            0,
            cost,
            started_at.elapsed().as_millis() as u64,
            err.status_code().as_u16(),
            Some(err.to_string()),
        );
        self.logs.enqueue(entry);
    }

    /// Records whether an upstream failure should count against the
    /// breaker for this model: connection-level failures and 5xx do,
    /// client errors (4xx) do not.
    fn counts_as_breaker_failure(err: &GatewayError) -> bool {
        matches!(err, GatewayError::UpstreamUnavailable)
            || matches!(err, GatewayError::UpstreamHttpError { status, .. } if *status >= 500)
    }

    pub async fn complete(&self, req: IncomingRequest<'_>) -> Result<ChatResponse, GatewayError> {
        let (principal, decision, request_id, limit, remaining, reset_at) = self.admit(&req).await?;
        let started_at = Instant::now();

        let breaker = self.breakers.get(&decision.model).await;
        if !breaker.can_execute().await {
            let err = GatewayError::BreakerOpen(decision.model.clone());
            self.log_failure(&principal, &decision, &request_id, started_at, &err);
            return Err(err);
        }

        let upstream_req = self.upstream_request(&req.body, &decision, false);
        match self.upstream.complete(&upstream_req).await {
            Ok(body) => {
                breaker.record_success().await;
                let (prompt_tokens, completion_tokens) = body
                    .usage
                    .as_ref()
                    .map(|u| (u.prompt_tokens, u.completion_tokens))
                    .unwrap_or((0, 0));
                let cost = log_pipeline::compute_cost(&decision.model, prompt_tokens, completion_tokens);
                let entry = LogEntry::new(
                    request_id.clone(),
                    principal.user_id.clone(),
                    principal.api_key_id,
                    decision.stage.as_str().to_string(),
                    decision.model.clone(),
                    prompt_tokens,
                    completion_tokens,
                    cost,
                    started_at.elapsed().as_millis() as u64,
                    200,
                    None,
                );
                self.logs.enqueue(entry);
                Ok(ChatResponse {
                    request_id,
                    decision,
                    body,
                    quota_limit: limit,
                    remaining_quota: remaining,
                    quota_reset_at: reset_at,
                })
            }
            Err(err) => {
                if Self::counts_as_breaker_failure(&err) {
                    breaker.record_failure().await;
                }
                self.log_failure(&principal, &decision, &request_id, started_at, &err);
                Err(err)
            }
        }
    }

    /// Streaming chat completion. The concurrency slot is held by the
    /// returned stream's `ConcurrencyPermit` and released when the stream
    /// is dropped, whether it ran to completion or the client disconnected
    /// partway through.
    pub async fn stream(&self, req: IncomingRequest<'_>) -> Result<ChatStream, GatewayError> {
        let (principal, decision, request_id, limit, remaining, reset_at) = self.admit(&req).await?;
        let started_at = Instant::now();

        let breaker = self.breakers.get(&decision.model).await;
        if !breaker.can_execute().await {
            let err = GatewayError::BreakerOpen(decision.model.clone());
            self.log_failure(&principal, &decision, &request_id, started_at, &err);
            return Err(err);
        }

        let permit = match self.concurrency.try_acquire_scoped(&principal.user_id, true).await {
            Some(permit) => permit,
            None => {
                let err = GatewayError::ConcurrencyExceeded;
                self.log_failure(&principal, &decision, &request_id, started_at, &err);
                return Err(err);
            }
        };

        let upstream_req = self.upstream_request(&req.body, &decision, true);
        let lines = match self.upstream.stream(&upstream_req).await {
            Ok(lines) => lines,
            Err(err) => {
                if Self::counts_as_breaker_failure(&err) {
                    breaker.record_failure().await;
                }
                self.log_failure(&principal, &decision, &request_id, started_at, &err);
                return Err(err);
            }
        };
        breaker.record_success().await;

        let wrapped = wrap_stream(
            lines,
            permit,
            self.logs.clone(),
            principal,
            decision.clone(),
            request_id.clone(),
            started_at,
        );

        Ok(ChatStream {
            request_id,
            decision,
            quota_limit: limit,
            remaining_quota: remaining,
            quota_reset_at: reset_at,
            lines: wrapped,
        })
    }
}

/// Holds the concurrency permit alive for the stream's lifetime and
/// enqueues one billing log entry once the upstream stream is exhausted.
/// Token counts are unavailable for a streamed response (the gateway does
/// not buffer or parse SSE deltas), so streamed entries carry zero token
/// counts and zero cost; durable per-line usage accounting is out of scope.
fn wrap_stream(
    mut lines: Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>,
    permit: ConcurrencyPermit,
    logs: LogPipeline,
    principal: Principal,
    decision: RoutingDecision,
    request_id: String,
    started_at: Instant,
) -> Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>> {
    let out = async_stream::stream! {
        let mut saw_error = false;
        while let Some(item) = lines.next().await {
            if item.is_err() {
                saw_error = true;
            }
            yield item;
        }
        // Stream ran to completion rather than being dropped mid-iteration;
        // release the slot now instead of waiting on `Drop`.
        permit.release().await;

        let cost = log_pipeline::compute_cost(&decision.model, 0, 0);
        let entry = LogEntry::new(
            request_id,
            principal.user_id,
            principal.api_key_id,
            decision.stage.as_str().to_string(),
            decision.model,
            0,
            0,
            cost,
            started_at.elapsed().as_millis() as u64,
            if saw_error { 502 } else { 200 },
            if saw_error { Some("upstream stream error".to_string()) } else { None },
        );
        logs.enqueue(entry);
    };
    Box::pin(out)
}
