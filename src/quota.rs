//! Per-user daily quota counter.
//!
//! A mutex-guarded map keyed by identity, reset on day rollover, backs the
//! in-memory implementation; a durable backend on top of the relational
//! store is also provided for production use.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct QuotaStatus {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    tomorrow.and_hms_opt(0, 0, 0).unwrap().and_utc()
}

#[async_trait::async_trait]
pub trait QuotaBackend: Send + Sync {
    /// Atomically increments the user's counter for today and reports the
    /// admission decision. Fails open (allowed=true) on backend error.
    async fn check_and_increment(&self, user_id: &str, limit: u32) -> QuotaStatus;
}

/// Durable backend: an upsert against `usage_counters(user_id, day)`.
pub struct DurableQuota {
    pool: sqlx::PgPool,
}

impl DurableQuota {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl QuotaBackend for DurableQuota {
    async fn check_and_increment(&self, user_id: &str, limit: u32) -> QuotaStatus {
        let now = Utc::now();
        let today: NaiveDate = now.date_naive();
        let reset_at = next_utc_midnight(now);

        let result: Result<i64, sqlx::Error> = sqlx::query_scalar(
            "INSERT INTO usage_counters (user_id, day, request_count, updated_at) \
             VALUES ($1, $2, 1, now()) \
             ON CONFLICT (user_id, day) \
             DO UPDATE SET request_count = usage_counters.request_count + 1, updated_at = now() \
             RETURNING request_count",
        )
        .bind(user_id)
        .bind(today)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(count) => {
                let count = count.max(0) as u32;
                let allowed = count <= limit;
                QuotaStatus { allowed, remaining: limit.saturating_sub(count), reset_at }
            }
            Err(err) => {
                tracing::warn!(error = %err, user_id, "quota store error, failing open");
                QuotaStatus { allowed: true, remaining: limit, reset_at }
            }
        }
    }
}

/// In-memory fallback: one mutex-protected map, reset whenever a call
/// observes the UTC date has rolled over since the last reset.
pub struct InMemoryQuota {
    inner: Mutex<InMemoryState>,
}

struct InMemoryState {
    counts: HashMap<String, u32>,
    last_reset_day: NaiveDate,
}

impl Default for InMemoryQuota {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQuota {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(InMemoryState {
                counts: HashMap::new(),
                last_reset_day: Utc::now().date_naive(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl QuotaBackend for InMemoryQuota {
    async fn check_and_increment(&self, user_id: &str, limit: u32) -> QuotaStatus {
        let now = Utc::now();
        let today = now.date_naive();
        let reset_at = next_utc_midnight(now);

        let mut state = self.inner.lock().await;
        if today != state.last_reset_day {
            state.counts.clear();
            state.last_reset_day = today;
        }

        let entry = state.counts.entry(user_id.to_string()).or_insert(0);
        *entry += 1;
        let count = *entry;

        QuotaStatus { allowed: count <= limit, remaining: limit.saturating_sub(count), reset_at }
    }
}

/// Process-wide quota counter, wrapping whichever backend is configured.
#[derive(Clone)]
pub struct QuotaCounter {
    backend: Arc<dyn QuotaBackend>,
}

impl QuotaCounter {
    pub fn new(backend: Arc<dyn QuotaBackend>) -> Self {
        Self { backend }
    }

    pub async fn check_and_increment(&self, user_id: &str, limit: u32) -> QuotaStatus {
        self.backend.check_and_increment(user_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_calls_admit_exactly_the_limit() {
        let quota = InMemoryQuota::new();
        let limit = 3;
        let mut allowed_count = 0;
        let mut denied_count = 0;
        for _ in 0..5 {
            let status = quota.check_and_increment("user-a", limit).await;
            if status.allowed {
                allowed_count += 1;
            } else {
                denied_count += 1;
            }
        }
        assert_eq!(allowed_count, 3);
        assert_eq!(denied_count, 2);
    }

    #[tokio::test]
    async fn remaining_decreases_with_each_allowed_call() {
        let quota = InMemoryQuota::new();
        let limit = 5;
        let s1 = quota.check_and_increment("user-b", limit).await;
        assert_eq!(s1.remaining, 4);
        let s2 = quota.check_and_increment("user-b", limit).await;
        assert_eq!(s2.remaining, 3);
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let quota = InMemoryQuota::new();
        let limit = 1;
        let a1 = quota.check_and_increment("user-a", limit).await;
        assert!(a1.allowed);
        let b1 = quota.check_and_increment("user-b", limit).await;
        assert!(b1.allowed);
        let a2 = quota.check_and_increment("user-a", limit).await;
        assert!(!a2.allowed);
    }

    #[tokio::test]
    async fn denied_requests_still_increment_the_counter() {
        let quota = InMemoryQuota::new();
        let limit = 1;
        let _ = quota.check_and_increment("user-c", limit).await;
        let second = quota.check_and_increment("user-c", limit).await;
        assert!(!second.allowed);
        assert_eq!(second.remaining, 0);
    }
}
