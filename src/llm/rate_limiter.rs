// Fixed-window rate limiting for classification calls
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Counter key shared by every worker making classification calls.
pub const CLASSIFY_CALLS_KEY: &str = "openai:classification:calls";

/// Fixed window length for the classification quota.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Shared counter with expiry, backing the fixed-window limiter. The
/// increment must be atomic in the store; read-then-write undercounts when
/// several workers race.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<u64>;

    /// Atomically increment the counter and return the new value. When the
    /// increment creates the key, its expiry is set to one window from now.
    async fn increment(&self, key: &str, window: Duration) -> anyhow::Result<u64>;
}

pub struct RedisCounterStore {
    client: Arc<redis::Client>,
}

impl RedisCounterStore {
    pub fn new(client: Arc<redis::Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> anyhow::Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<u64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn increment(&self, key: &str, window: Duration) -> anyhow::Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // INCR and the first-increment EXPIRE land in one script call; done
        // as two commands, a crash in between leaves a counter with no TTL
        // that jams the window forever.
        let script = redis::Script::new(
            r#"local value = redis.call('INCR', KEYS[1])
if value == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return value"#,
        );
        let value: u64 = script
            .key(key)
            .arg(window.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }
}

/// Deterministic in-process store. Used by the test suite; windows are
/// tracked per key with the same first-increment anchoring as the redis
/// store.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> anyhow::Result<u64> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        match counters.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                counters.remove(key);
                Ok(0)
            }
            Some((value, _)) => Ok(*value),
            None => Ok(0),
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> anyhow::Result<u64> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let entry = counters.entry(key.to_string()).or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

/// Fixed-window counter against a ceiling. No queueing and no backoff: a
/// denied acquisition is reported to the caller, which decides what to do.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    key: String,
    ceiling: u32,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, ceiling: u32, window: Duration) -> Self {
        Self {
            store,
            key: CLASSIFY_CALLS_KEY.to_string(),
            ceiling,
            window,
        }
    }

    /// Whether a call would currently be admitted, without consuming a slot.
    pub async fn check(&self) -> anyhow::Result<bool> {
        Ok(self.store.get(&self.key).await? < u64::from(self.ceiling))
    }

    /// Consume a slot in the current window. Returns false when the window
    /// is exhausted.
    pub async fn try_acquire(&self) -> anyhow::Result<bool> {
        Ok(self.store.increment(&self.key, self.window).await? <= u64::from(self.ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(ceiling: u32, window: Duration) -> FixedWindowLimiter {
        FixedWindowLimiter::new(Arc::new(InMemoryCounterStore::new()), ceiling, window)
    }

    #[tokio::test]
    async fn admits_exactly_the_ceiling_within_a_window() {
        let limiter = limiter(10, WINDOW);
        for _ in 0..10 {
            assert!(limiter.try_acquire().await.unwrap());
        }
        assert!(!limiter.try_acquire().await.unwrap());
        assert!(!limiter.check().await.unwrap());
    }

    #[tokio::test]
    async fn window_expiry_readmits_calls() {
        let limiter = limiter(2, Duration::from_millis(50));
        assert!(limiter.try_acquire().await.unwrap());
        assert!(limiter.try_acquire().await.unwrap());
        assert!(!limiter.try_acquire().await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.check().await.unwrap());
        assert!(limiter.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn check_does_not_consume_a_slot() {
        let limiter = limiter(1, WINDOW);
        assert!(limiter.check().await.unwrap());
        assert!(limiter.check().await.unwrap());
        assert!(limiter.try_acquire().await.unwrap());
        assert!(!limiter.check().await.unwrap());
    }

    #[tokio::test]
    async fn zero_ceiling_denies_everything() {
        let limiter = limiter(0, WINDOW);
        assert!(!limiter.check().await.unwrap());
        assert!(!limiter.try_acquire().await.unwrap());
    }
}
