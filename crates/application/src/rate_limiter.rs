//! 滑动窗口限流
//!
//! 计数必须集中存放：同一用户的多个连接可能落在不同进程上，进程内计数会少算。
//! [`RedisRateLimiter`] 是生产实现，[`MemoryRateLimiter`] 只用于单进程运行和测试。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use domain::{Timestamp, UserId};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ApplicationError;

/// 一次限流判定的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// 本窗口内还能发起的请求数
    pub remaining: u32,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// 先淘汰 `now - window` 之前的记录再计数；超限时返回 `allowed = false` 且不再累加
    async fn allow(
        &self,
        user_id: UserId,
        action: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateDecision, ApplicationError>;
}

struct Bucket {
    window: chrono::Duration,
    hits: VecDeque<Timestamp>,
}

/// 进程内实现。每次判定时顺带清掉窗口内已没有记录的键
pub struct MemoryRateLimiter {
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<(UserId, String), Bucket>>,
}

impl MemoryRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(
        &self,
        user_id: UserId,
        action: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateDecision, ApplicationError> {
        let now = self.clock.now();
        let window = chrono::Duration::from_std(window).map_err(|err| {
            ApplicationError::infrastructure_with_source("invalid rate window", err)
        })?;
        let cutoff = now - window;
        let key = (user_id, action.to_string());

        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buckets.retain(|_, bucket| {
            bucket
                .hits
                .back()
                .is_some_and(|ts| *ts > now - bucket.window)
        });

        let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
            window,
            hits: VecDeque::new(),
        });
        bucket.window = window;
        while bucket.hits.front().is_some_and(|ts| *ts <= cutoff) {
            bucket.hits.pop_front();
        }

        let count = bucket.hits.len() as u32;
        if count >= max_requests {
            if bucket.hits.is_empty() {
                buckets.remove(&key);
            }
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
            });
        }

        bucket.hits.push_back(now);
        Ok(RateDecision {
            allowed: true,
            remaining: max_requests - count - 1,
        })
    }
}

// KEYS[1] = 计数键; ARGV = now_ms, window_ms, max, member
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count >= max then
  return {0, 0}
end
redis.call('ZADD', key, now, ARGV[4])
redis.call('PEXPIRE', key, window)
return {1, max - count - 1}
"#;

/// Redis 有序集合 + Lua 脚本实现，淘汰、计数和写入在一次原子调用内完成
#[derive(Clone)]
pub struct RedisRateLimiter {
    connection: ConnectionManager,
    key_prefix: String,
    clock: Arc<dyn Clock>,
    script: Arc<redis::Script>,
}

impl RedisRateLimiter {
    pub fn new(
        connection: ConnectionManager,
        key_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.into(),
            clock,
            script: Arc::new(redis::Script::new(SLIDING_WINDOW_SCRIPT)),
        }
    }

    fn key(&self, user_id: UserId, action: &str) -> String {
        format!("{}:rate:{}:{}", self.key_prefix, action, user_id)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(
        &self,
        user_id: UserId,
        action: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateDecision, ApplicationError> {
        let now_ms = self.clock.now().timestamp_millis();
        let member = format!("{now_ms}-{}", Uuid::new_v4());
        let mut conn = self.connection.clone();

        let (allowed, remaining): (i64, i64) = self
            .script
            .key(self.key(user_id, action))
            .arg(now_ms)
            .arg(window.as_millis() as i64)
            .arg(max_requests)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                let message = format!("Redis rate limiter failed: {e}");
                ApplicationError::infrastructure_with_source(message, e)
            })?;

        Ok(RateDecision {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn limiter() -> (Arc<ManualClock>, MemoryRateLimiter) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = MemoryRateLimiter::new(clock.clone());
        (clock, limiter)
    }

    #[tokio::test]
    async fn thirty_first_send_in_window_is_rejected() {
        let (clock, limiter) = limiter();
        let user = UserId::generate();
        let window = Duration::from_secs(30);

        for i in 0..30 {
            let decision = limiter.allow(user, "send_message", 30, window).await.unwrap();
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.remaining, 29 - i);
            clock.advance(chrono::Duration::milliseconds(100));
        }

        let decision = limiter.allow(user, "send_message", 30, window).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn window_expiry_resets_the_count() {
        let (clock, limiter) = limiter();
        let user = UserId::generate();
        let window = Duration::from_secs(30);

        for _ in 0..30 {
            limiter.allow(user, "send_message", 30, window).await.unwrap();
        }
        assert!(!limiter.allow(user, "send_message", 30, window).await.unwrap().allowed);

        clock.advance(chrono::Duration::seconds(31));
        let decision = limiter.allow(user, "send_message", 30, window).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 29);
    }

    #[tokio::test]
    async fn rejected_requests_do_not_extend_the_window() {
        let (clock, limiter) = limiter();
        let user = UserId::generate();
        let window = Duration::from_secs(10);

        limiter.allow(user, "typing", 1, window).await.unwrap();
        for _ in 0..4 {
            clock.advance(chrono::Duration::seconds(2));
            assert!(!limiter.allow(user, "typing", 1, window).await.unwrap().allowed);
        }
        clock.advance(chrono::Duration::seconds(2));
        assert!(limiter.allow(user, "typing", 1, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn counters_are_scoped_by_user_and_action() {
        let (_clock, limiter) = limiter();
        let alice = UserId::generate();
        let bob = UserId::generate();
        let window = Duration::from_secs(30);

        assert!(limiter.allow(alice, "send_message", 1, window).await.unwrap().allowed);
        assert!(!limiter.allow(alice, "send_message", 1, window).await.unwrap().allowed);
        assert!(limiter.allow(bob, "send_message", 1, window).await.unwrap().allowed);
        assert!(limiter.allow(alice, "typing", 1, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn idle_keys_are_dropped_once_their_window_passes() {
        let (clock, limiter) = limiter();
        let window = Duration::from_secs(30);

        for _ in 0..50 {
            limiter
                .allow(UserId::generate(), "send_message", 30, window)
                .await
                .unwrap();
        }
        assert_eq!(limiter.tracked_keys(), 50);

        clock.advance(chrono::Duration::seconds(31));
        let user = UserId::generate();
        assert!(limiter.allow(user, "send_message", 30, window).await.unwrap().allowed);
        assert_eq!(limiter.tracked_keys(), 1);

        assert!(!limiter.allow(user, "typing", 0, window).await.unwrap().allowed);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
