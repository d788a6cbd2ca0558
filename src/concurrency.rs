//! Per-user concurrent-stream limiter.
//!
//! One mutex guards the whole slot table; critical sections are O(1). A
//! scoped-acquisition guard guarantees the slot is released on every exit
//! path, including cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

#[derive(Clone)]
pub struct ConcurrencyLimiter {
    max_concurrent: u32,
    slots: Arc<Mutex<HashMap<String, u32>>>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: u32) -> Self {
        Self { max_concurrent, slots: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Non-streaming requests never touch the table and always succeed.
    pub async fn acquire(&self, user_id: &str, is_streaming: bool) -> bool {
        if !is_streaming {
            return true;
        }
        let mut slots = self.slots.lock().await;
        let current = slots.get(user_id).copied().unwrap_or(0);
        if current >= self.max_concurrent {
            return false;
        }
        slots.insert(user_id.to_string(), current + 1);
        true
    }

    pub async fn release(&self, user_id: &str, is_streaming: bool) {
        if !is_streaming {
            return;
        }
        let mut slots = self.slots.lock().await;
        match slots.get_mut(user_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                slots.remove(user_id);
            }
            None => {
                tracing::warn!(user_id, "released a concurrency slot with no tracked entry");
            }
        }
    }

    /// Acquire a scoped permit that releases on drop, guaranteeing release
    /// on every exit path (normal completion, error, or cancellation).
    pub async fn try_acquire_scoped(
        &self,
        user_id: &str,
        is_streaming: bool,
    ) -> Option<ConcurrencyPermit> {
        if self.acquire(user_id, is_streaming).await {
            Some(ConcurrencyPermit {
                limiter: self.clone(),
                user_id: user_id.to_string(),
                is_streaming,
                released: false,
            })
        } else {
            None
        }
    }

    #[cfg(test)]
    async fn current(&self, user_id: &str) -> u32 {
        self.slots.lock().await.get(user_id).copied().unwrap_or(0)
    }

    #[cfg(test)]
    async fn contains(&self, user_id: &str) -> bool {
        self.slots.lock().await.contains_key(user_id)
    }
}

/// RAII guard releasing a concurrency slot. Dropping the guard (normal
/// return, early `?`, or task cancellation) always releases exactly once.
pub struct ConcurrencyPermit {
    limiter: ConcurrencyLimiter,
    user_id: String,
    is_streaming: bool,
    released: bool,
}

impl ConcurrencyPermit {
    /// Release immediately instead of waiting for drop. Safe to call more
    /// than once; only the first call has an effect.
    pub async fn release(mut self) {
        self.release_inner().await;
    }

    async fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.limiter.release(&self.user_id, self.is_streaming).await;
        }
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if !self.released && self.is_streaming {
            let limiter = self.limiter.clone();
            let user_id = self.user_id.clone();
            self.released = true;
            tokio::spawn(async move {
                limiter.release(&user_id, true).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_by_max_concurrent() {
        let limiter = ConcurrencyLimiter::new(2);
        assert!(limiter.acquire("u1", true).await);
        assert!(limiter.acquire("u1", true).await);
        assert!(!limiter.acquire("u1", true).await);
    }

    #[tokio::test]
    async fn acquire_release_balance_returns_to_zero_and_evicts() {
        let limiter = ConcurrencyLimiter::new(3);
        limiter.acquire("u1", true).await;
        limiter.acquire("u1", true).await;
        limiter.release("u1", true).await;
        limiter.release("u1", true).await;
        assert_eq!(limiter.current("u1").await, 0);
        assert!(!limiter.contains("u1").await);
    }

    #[tokio::test]
    async fn users_are_independent() {
        let limiter = ConcurrencyLimiter::new(1);
        assert!(limiter.acquire("u1", true).await);
        assert!(limiter.acquire("u2", true).await);
        assert!(!limiter.acquire("u1", true).await);
        assert!(!limiter.acquire("u2", true).await);
    }

    #[tokio::test]
    async fn non_streaming_always_succeeds_and_never_touches_table() {
        let limiter = ConcurrencyLimiter::new(0);
        assert!(limiter.acquire("u1", false).await);
        assert!(!limiter.contains("u1").await);
        limiter.release("u1", false).await;
    }

    #[tokio::test]
    async fn scoped_permit_releases_on_drop() {
        let limiter = ConcurrencyLimiter::new(1);
        {
            let _permit = limiter.try_acquire_scoped("u1", true).await.unwrap();
            assert_eq!(limiter.current("u1").await, 1);
        }
        // Drop spawns the release; yield so the spawned task runs.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(limiter.current("u1").await, 0);
    }

    #[tokio::test]
    async fn scoped_permit_rejects_when_exhausted() {
        let limiter = ConcurrencyLimiter::new(1);
        let _permit = limiter.try_acquire_scoped("u1", true).await.unwrap();
        assert!(limiter.try_acquire_scoped("u1", true).await.is_none());
    }
}
