//! Upstream LLM proxy client: request/response completion with retry, and
//! a streaming pass-through that shadows an upstream SSE body (buffer,
//! forward, append a terminal sentinel).
//!
//! One client pointed at a single configured proxy, rather than a
//! per-provider config struct, since the gateway speaks to exactly one
//! upstream.

use std::pin::Pin;
use std::time::Duration;

use async_stream::stream;
use futures_util::{Stream, StreamExt};

use crate::config::UpstreamConfig;
use crate::error::GatewayError;
use crate::types::{CompletionResponse, UpstreamCompletionRequest};

const RETRYABLE_STATUSES: [u16; 3] = [502, 503, 504];
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
        })
    }

    fn build_request(&self, req: &UpstreamCompletionRequest) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(url).json(req);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    /// Non-streaming completion. Retries transient upstream faults up to
    /// `max_retries` additional attempts with a fixed 1s delay.
    pub async fn complete(
        &self,
        req: &UpstreamCompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        let mut attempt = 0;
        loop {
            let result = self.build_request(req).send().await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<CompletionResponse>()
                            .await
                            .map_err(|e| GatewayError::Internal(e.into()));
                    }
                    if RETRYABLE_STATUSES.contains(&status.as_u16()) && attempt < self.max_retries {
                        attempt += 1;
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(GatewayError::UpstreamHttpError { status: status.as_u16(), body });
                }
                Err(err) if is_transient(&err) && attempt < self.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) if is_transient(&err) => return Err(GatewayError::UpstreamUnavailable),
                Err(err) => return Err(GatewayError::Internal(err.into())),
            }
        }
    }

    /// Streaming completion: a single POST piping upstream SSE lines
    /// through verbatim, terminated by `data: [DONE]\n\n`. Does not retry;
    /// a mid-stream failure surfaces as `UpstreamUnavailable`.
    pub async fn stream(
        &self,
        req: &UpstreamCompletionRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>, GatewayError> {
        let response = self.build_request(req).send().await.map_err(|err| {
            if is_transient(&err) {
                GatewayError::UpstreamUnavailable
            } else {
                GatewayError::Internal(err.into())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamHttpError { status: status.as_u16(), body });
        }

        let mut byte_stream = response.bytes_stream();
        let out = stream! {
            let mut buffer = String::new();
            loop {
                match byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(idx) = buffer.find('\n') {
                            let line: String = buffer.drain(..=idx).collect();
                            let line = line.trim_end_matches(['\r', '\n']);
                            if !line.is_empty() {
                                yield Ok(line.to_string());
                            }
                        }
                    }
                    Some(Err(_)) => {
                        yield Err(GatewayError::UpstreamUnavailable);
                        return;
                    }
                    None => break,
                }
            }
            if !buffer.trim().is_empty() {
                yield Ok(buffer.trim().to_string());
            }
            yield Ok("data: [DONE]".to_string());
        };

        Ok(Box::pin(out))
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request()
}
