//! Asynchronous, non-blocking log pipeline for billing records.
//!
//! A bounded `mpsc` channel decouples the hot request path from the
//! durable write: `enqueue` uses `try_send` and never awaits, so a full
//! queue drops the entry with a warning instead of stalling a request.
//! A background worker drains batches on a fixed interval. Billing cost is
//! computed from a static per-million-token price table in exact decimal
//! arithmetic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::RngCore;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::LogPipelineConfig;
use crate::types::LogEntry;

/// Prices per million tokens, USD, in exact decimal.
#[derive(Debug, Clone, Copy)]
struct ModelPrice {
    prompt_per_million: Decimal,
    completion_per_million: Decimal,
}

/// Built-in price table. Resolution is **longest-prefix match**: the
/// configured key that is the longest prefix of the requested model name
/// wins, so `gpt-4-turbo` resolves against `gpt-4-turbo` rather than the
/// shorter `gpt-4` entry.
fn price_table() -> &'static [(&'static str, ModelPrice)] {
    PRICE_TABLE.as_slice()
}

static PRICE_TABLE: Lazy<Vec<(&'static str, ModelPrice)>> = Lazy::new(|| {
    use std::str::FromStr;
    let entries: &[(&str, &str, &str)] = &[
        ("gpt-4-turbo", "10", "30"),
        ("gpt-4o-mini", "0.15", "0.60"),
        ("gpt-4o", "2.50", "10"),
        ("gpt-4", "30", "60"),
        ("gpt-3.5-turbo", "0.50", "1.50"),
        ("claude-3-5-sonnet", "3", "15"),
        ("claude-3-haiku", "0.25", "1.25"),
        ("claude-3-opus", "15", "75"),
        ("claude", "3", "15"),
        ("gemini-1.5-pro", "1.25", "5"),
        ("gemini-1.5-flash", "0.075", "0.30"),
    ];
    entries
        .iter()
        .map(|(name, p, c)| {
            (
                *name,
                ModelPrice {
                    prompt_per_million: Decimal::from_str(p).unwrap(),
                    completion_per_million: Decimal::from_str(c).unwrap(),
                },
            )
        })
        .collect()
});

fn fallback_price() -> ModelPrice {
    use std::str::FromStr;
    ModelPrice {
        prompt_per_million: Decimal::from_str("1").unwrap(),
        completion_per_million: Decimal::from_str("2").unwrap(),
    }
}

fn resolve_price(model: &str) -> ModelPrice {
    price_table()
        .iter()
        .filter(|(key, _)| model.starts_with(key))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, price)| *price)
        .unwrap_or_else(fallback_price)
}

/// `cost = prompt_tokens * price_prompt + completion_tokens * price_completion`,
/// prices expressed per million tokens, computed in exact decimal arithmetic.
pub fn compute_cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> Decimal {
    let price = resolve_price(model);
    let million = Decimal::from(1_000_000u32);
    let prompt_cost = Decimal::from(prompt_tokens) * price.prompt_per_million / million;
    let completion_cost = Decimal::from(completion_tokens) * price.completion_per_million / million;
    prompt_cost + completion_cost
}

/// Request-ID generator: `cfx-` followed by 32 lowercase hex characters.
/// Memoizes recently issued IDs to detect collisions; the memo is
/// periodically truncated to bound memory.
pub struct RequestIdGenerator {
    recent: Mutex<VecDeque<String>>,
    memo_cap: usize,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl RequestIdGenerator {
    pub fn new(memo_cap: usize) -> Self {
        Self { recent: Mutex::new(VecDeque::with_capacity(memo_cap)), memo_cap }
    }

    pub async fn generate(&self) -> String {
        loop {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            let id = format!("cfx-{}", hex::encode(bytes));

            let mut recent = self.recent.lock().await;
            if recent.contains(&id) {
                tracing::warn!(request_id = %id, "request id collision detected, regenerating");
                continue;
            }
            recent.push_back(id.clone());
            while recent.len() > self.memo_cap {
                recent.pop_front();
            }
            return id;
        }
    }
}

/// Abstraction over the durable sink a batch is flushed to.
#[async_trait::async_trait]
pub trait LogSink: Send + Sync {
    async fn write_batch(&self, entries: &[LogEntry]) -> anyhow::Result<()>;
}

pub struct PgLogSink {
    pool: sqlx::PgPool,
}

impl PgLogSink {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LogSink for PgLogSink {
    async fn write_batch(&self, entries: &[LogEntry]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO request_logs \
                 (request_id, user_id, api_key_id, stage, model, prompt_tokens, completion_tokens, \
                  total_tokens, cost, latency_ms, status_code, error_message, created_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
            )
            .bind(&entry.request_id)
            .bind(&entry.user_id)
            .bind(entry.api_key_id)
            .bind(&entry.stage)
            .bind(&entry.model)
            .bind(entry.prompt_tokens as i64)
            .bind(entry.completion_tokens as i64)
            .bind(entry.total_tokens as i64)
            .bind(entry.cost)
            .bind(entry.latency_ms as i64)
            .bind(entry.status_code as i32)
            .bind(&entry.error_message)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

struct NoopSink;

#[async_trait::async_trait]
impl LogSink for NoopSink {
    async fn write_batch(&self, entries: &[LogEntry]) -> anyhow::Result<()> {
        tracing::debug!(count = entries.len(), "no durable store configured, discarding batch");
        Ok(())
    }
}

struct PipelineInner {
    sender: mpsc::Sender<LogEntry>,
    dropped: AtomicUsize,
}

/// Process-wide log pipeline handle. Cheap to clone.
#[derive(Clone)]
pub struct LogPipeline {
    inner: Arc<PipelineInner>,
}

pub struct LogPipelineHandle {
    worker: JoinHandle<()>,
    receiver: Arc<Mutex<mpsc::Receiver<LogEntry>>>,
    sink: Arc<dyn LogSink>,
    config: LogPipelineConfig,
}

impl LogPipeline {
    /// Enqueue a log entry. Non-blocking: on a full queue the entry is
    /// dropped and a warning logged; the hot path never stalls.
    pub fn enqueue(&self, entry: LogEntry) -> bool {
        match self.inner.sender.try_send(entry) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped_total = dropped, "log queue full, dropping entry");
                false
            }
        }
    }
}

/// Starts the background flush worker and returns both the enqueue handle
/// (`LogPipeline`) and a lifecycle handle whose `stop()` drains the queue.
pub fn start(config: LogPipelineConfig, sink: Arc<dyn LogSink>) -> (LogPipeline, LogPipelineHandle) {
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let inner = Arc::new(PipelineInner { sender: tx, dropped: AtomicUsize::new(0) });
    let pipeline = LogPipeline { inner };

    let receiver = Arc::new(Mutex::new(rx));
    let worker_sink = sink.clone();
    let worker_config = config.clone();
    let worker_receiver = receiver.clone();
    let worker = tokio::spawn(worker_loop(worker_receiver, worker_sink, worker_config));

    (pipeline, LogPipelineHandle { worker, receiver, sink, config })
}

pub fn noop_sink() -> Arc<dyn LogSink> {
    Arc::new(NoopSink)
}

async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<LogEntry>>>,
    sink: Arc<dyn LogSink>,
    config: LogPipelineConfig,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(config.flush_interval_ms));
    loop {
        interval.tick().await;
        let batch = {
            let mut rx = rx.lock().await;
            drain_batch(&mut rx, config.batch_size)
        };
        if batch.is_empty() {
            continue;
        }
        flush_with_retry(&sink, &batch, config.retry_attempts).await;
    }
}

fn drain_batch(rx: &mut mpsc::Receiver<LogEntry>, batch_size: usize) -> Vec<LogEntry> {
    let mut batch = Vec::with_capacity(batch_size);
    while batch.len() < batch_size {
        match rx.try_recv() {
            Ok(entry) => batch.push(entry),
            Err(_) => break,
        }
    }
    batch
}

async fn flush_with_retry(sink: &Arc<dyn LogSink>, batch: &[LogEntry], retry_attempts: u32) {
    let mut attempt = 0;
    loop {
        match sink.write_batch(batch).await {
            Ok(()) => return,
            Err(err) => {
                attempt += 1;
                if attempt > retry_attempts {
                    tracing::error!(error = %err, batch_size = batch.len(), "log batch write failed, discarding");
                    return;
                }
                tracing::warn!(error = %err, attempt, "log batch write failed, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(200 * attempt as u64)).await;
            }
        }
    }
}

impl LogPipelineHandle {
    /// Drains the remaining queue by repeatedly invoking the batch writer,
    /// then cancels the worker. Safe to call on an empty queue.
    pub async fn stop(self) {
        self.worker.abort();
        loop {
            let batch = {
                let mut rx = self.receiver.lock().await;
                drain_batch(&mut rx, self.config.batch_size)
            };
            if batch.is_empty() {
                break;
            }
            flush_with_retry(&self.sink, &batch, self.config.retry_attempts).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_linear_in_token_counts() {
        let base = compute_cost("gpt-4o", 100, 50);
        let scaled = compute_cost("gpt-4o", 300, 150);
        assert_eq!(scaled, base * Decimal::from(3));
    }

    #[test]
    fn cost_is_nonnegative_and_zero_at_origin() {
        assert_eq!(compute_cost("gpt-4o", 0, 0), Decimal::ZERO);
        assert!(compute_cost("gpt-4o", 10, 10) >= Decimal::ZERO);
    }

    #[test]
    fn longest_prefix_wins_for_ambiguous_model_names() {
        let turbo = resolve_price("gpt-4-turbo-preview");
        let plain = resolve_price("gpt-4");
        assert_ne!(turbo.prompt_per_million, plain.prompt_per_million);
    }

    #[test]
    fn unknown_model_falls_back_to_default_price() {
        let price = resolve_price("some-unlisted-model-9000");
        assert_eq!(price.prompt_per_million, fallback_price().prompt_per_million);
    }

    #[tokio::test]
    async fn request_ids_match_expected_format() {
        let generator = RequestIdGenerator::default();
        for _ in 0..50 {
            let id = generator.generate().await;
            assert!(id.starts_with("cfx-"));
            let hex_part = &id[4..];
            assert_eq!(hex_part.len(), 32);
            assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[tokio::test]
    async fn enqueue_drops_on_full_queue_without_blocking() {
        let config = LogPipelineConfig { queue_capacity: 1, batch_size: 10, flush_interval_ms: 60_000, retry_attempts: 1 };
        let (pipeline, handle) = start(config, noop_sink());
        let entry = |n: u32| {
            LogEntry::new(
                format!("cfx-{n}"),
                "user".into(),
                None,
                "plan".into(),
                "gpt-4o".into(),
                1,
                1,
                Decimal::ZERO,
                1,
                200,
                None,
            )
        };
        assert!(pipeline.enqueue(entry(1)));
        // second may or may not land depending on scheduler, but eventually queue saturates
        let mut last_accepted = true;
        for n in 2..20 {
            last_accepted = pipeline.enqueue(entry(n));
        }
        let _ = last_accepted;
        handle.worker.abort();
    }
}
