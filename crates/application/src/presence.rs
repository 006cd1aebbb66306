use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{Timestamp, UserId};
use redis::aio::ConnectionManager;

use crate::clock::Clock;
use crate::error::ApplicationError;

/// 在线状态登记表
///
/// 只记录一个在线标志而不是连接数，多设备下最后断开的会话会把用户标为离线。
/// 这对在线提示足够，但不能用于权限判断。
#[async_trait]
pub trait PresenceTracker: Send + Sync {
    /// 标记在线并返回登记时间
    async fn mark_online(&self, user_id: UserId) -> Result<Timestamp, ApplicationError>;

    async fn mark_offline(&self, user_id: UserId) -> Result<(), ApplicationError>;

    async fn is_online(&self, user_id: UserId) -> Result<bool, ApplicationError>;

    async fn last_seen(&self, user_id: UserId) -> Result<Option<Timestamp>, ApplicationError>;
}

#[derive(Debug, Clone, Copy)]
struct PresenceEntry {
    online: bool,
    last_seen: Timestamp,
}

/// 进程内实现
pub struct MemoryPresenceTracker {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<UserId, PresenceEntry>>,
}

impl MemoryPresenceTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn set(&self, user_id: UserId, online: bool) -> Timestamp {
        let now = self.clock.now();
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(
            user_id,
            PresenceEntry {
                online,
                last_seen: now,
            },
        );
        now
    }

    fn get(&self, user_id: UserId) -> Option<PresenceEntry> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(&user_id).copied()
    }
}

#[async_trait]
impl PresenceTracker for MemoryPresenceTracker {
    async fn mark_online(&self, user_id: UserId) -> Result<Timestamp, ApplicationError> {
        Ok(self.set(user_id, true))
    }

    async fn mark_offline(&self, user_id: UserId) -> Result<(), ApplicationError> {
        self.set(user_id, false);
        Ok(())
    }

    async fn is_online(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        Ok(self.get(user_id).is_some_and(|entry| entry.online))
    }

    async fn last_seen(&self, user_id: UserId) -> Result<Option<Timestamp>, ApplicationError> {
        Ok(self.get(user_id).map(|entry| entry.last_seen))
    }
}

/// Redis 实现：每个用户一个 hash，字段 `online` 与 `last_seen`（毫秒时间戳）
#[derive(Clone)]
pub struct RedisPresenceTracker {
    connection: ConnectionManager,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl RedisPresenceTracker {
    pub fn new(
        connection: ConnectionManager,
        key_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.into(),
            clock,
        }
    }

    fn key(&self, user_id: UserId) -> String {
        format!("{}:presence:{}", self.key_prefix, user_id)
    }

    async fn write(&self, user_id: UserId, online: bool) -> Result<Timestamp, ApplicationError> {
        let now = self.clock.now();
        let mut conn = self.connection.clone();

        let _: () = redis::cmd("HSET")
            .arg(self.key(user_id))
            .arg("online")
            .arg(if online { 1 } else { 0 })
            .arg("last_seen")
            .arg(now.timestamp_millis())
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                let message = format!("Redis operation failed: {e}");
                ApplicationError::infrastructure_with_source(message, e)
            })?;

        tracing::debug!(user_id = %user_id, online, "在线状态已更新");
        Ok(now)
    }

    async fn field(&self, user_id: UserId, field: &str) -> Result<Option<i64>, ApplicationError> {
        let mut conn = self.connection.clone();
        redis::cmd("HGET")
            .arg(self.key(user_id))
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                let message = format!("Redis operation failed: {e}");
                ApplicationError::infrastructure_with_source(message, e)
            })
    }
}

#[async_trait]
impl PresenceTracker for RedisPresenceTracker {
    async fn mark_online(&self, user_id: UserId) -> Result<Timestamp, ApplicationError> {
        self.write(user_id, true).await
    }

    async fn mark_offline(&self, user_id: UserId) -> Result<(), ApplicationError> {
        self.write(user_id, false).await.map(|_| ())
    }

    async fn is_online(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        Ok(self.field(user_id, "online").await? == Some(1))
    }

    async fn last_seen(&self, user_id: UserId) -> Result<Option<Timestamp>, ApplicationError> {
        Ok(self
            .field(user_id, "last_seen")
            .await?
            .and_then(DateTime::<Utc>::from_timestamp_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn offline_keeps_last_seen() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let tracker = MemoryPresenceTracker::new(clock.clone());
        let user = UserId::generate();

        assert!(!tracker.is_online(user).await.unwrap());
        assert_eq!(tracker.last_seen(user).await.unwrap(), None);

        let online_at = tracker.mark_online(user).await.unwrap();
        assert_eq!(online_at, start);
        assert!(tracker.is_online(user).await.unwrap());

        clock.advance(Duration::minutes(5));
        tracker.mark_offline(user).await.unwrap();
        assert!(!tracker.is_online(user).await.unwrap());
        assert_eq!(
            tracker.last_seen(user).await.unwrap(),
            Some(start + Duration::minutes(5))
        );
    }

    #[tokio::test]
    async fn last_disconnect_wins() {
        let tracker = MemoryPresenceTracker::new(Arc::new(ManualClock::new(Utc::now())));
        let user = UserId::generate();

        tracker.mark_online(user).await.unwrap();
        tracker.mark_online(user).await.unwrap();
        tracker.mark_offline(user).await.unwrap();
        assert!(!tracker.is_online(user).await.unwrap());
    }
}
