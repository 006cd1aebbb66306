//! Redis Pub/Sub 广播总线
//!
//! 每个分组对应一个频道 `{prefix}:fanout:{group}`。发布直接写 Redis，
//! 本进程用一个模式订阅收取所有分组的事件，再交给本地路由表投递。
//! 订阅与退订只改本地路由表，不涉及 Redis。

use std::sync::Arc;
use std::time::Duration;

use application::{
    FanoutBus, FanoutError, FanoutEvent, GroupName, SessionSink, SubscriptionHandle,
    SubscriptionRegistry,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RedisFanoutBus {
    publisher: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    key_prefix: String,
}

impl RedisFanoutBus {
    /// 建立发布连接并启动后台监听，`shutdown` 取消后监听退出
    pub async fn connect(
        client: Client,
        key_prefix: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Result<Self, redis::RedisError> {
        let key_prefix = key_prefix.into();
        let publisher = client.get_connection_manager().await?;
        let registry = Arc::new(SubscriptionRegistry::new());

        tokio::spawn(listen(
            client,
            channel_prefix(&key_prefix),
            registry.clone(),
            shutdown,
        ));

        Ok(Self {
            publisher,
            registry,
            key_prefix,
        })
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    fn channel(&self, group: GroupName) -> String {
        format!("{}{}", channel_prefix(&self.key_prefix), group)
    }
}

#[async_trait]
impl FanoutBus for RedisFanoutBus {
    async fn publish(&self, group: GroupName, event: FanoutEvent) -> Result<(), FanoutError> {
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.publisher.clone();
        let _: i64 = conn
            .publish(self.channel(group), payload)
            .await
            .map_err(|e| FanoutError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        group: GroupName,
        sink: SessionSink,
    ) -> Result<SubscriptionHandle, FanoutError> {
        let session_id = sink.id();
        self.registry.subscribe(group, sink);
        Ok(SubscriptionHandle { group, session_id })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), FanoutError> {
        self.registry.unsubscribe(handle.group, handle.session_id);
        Ok(())
    }
}

fn channel_prefix(key_prefix: &str) -> String {
    format!("{key_prefix}:fanout:")
}

/// 解析频道名和负载，得到目标分组和事件
fn decode(
    channel_prefix: &str,
    channel: &str,
    payload: &str,
) -> Result<(GroupName, FanoutEvent), FanoutError> {
    let group = channel
        .strip_prefix(channel_prefix)
        .ok_or_else(|| FanoutError::InvalidGroup(channel.to_string()))?
        .parse::<GroupName>()?;
    let event = serde_json::from_str(payload)?;
    Ok((group, event))
}

async fn listen(
    client: Client,
    channel_prefix: String,
    registry: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = pump(&client, &channel_prefix, &registry) => {
                match result {
                    Ok(()) => warn!("Redis 订阅连接已关闭，准备重连"),
                    Err(err) => warn!(error = %err, "Redis 订阅失败，准备重连"),
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    info!("Redis 广播监听已停止");
}

async fn pump(
    client: &Client,
    channel_prefix: &str,
    registry: &SubscriptionRegistry,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{channel_prefix}*")).await?;
    info!(pattern = %format!("{channel_prefix}*"), "Redis 广播监听已启动");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "无法读取广播负载");
                continue;
            }
        };

        match decode(channel_prefix, msg.get_channel_name(), &payload) {
            Ok((group, event)) => {
                let delivered = registry.route(group, &event);
                debug!(group = %group, event_type = %event.event_type, delivered, "广播已路由");
            }
            Err(err) => warn!(channel = msg.get_channel_name(), error = %err, "丢弃无法解析的广播"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ConversationId, UserId};
    use serde_json::json;

    #[test]
    fn decode_restores_group_and_delivery_class() {
        let prefix = channel_prefix("chat");
        let conversation = ConversationId::generate();
        let group = GroupName::Conversation(conversation);
        let event = FanoutEvent::best_effort("typing.update", json!({"is_typing": true}));
        let payload = serde_json::to_string(&event).unwrap();

        let (decoded_group, decoded) =
            decode(&prefix, &format!("{prefix}{group}"), &payload).unwrap();
        assert_eq!(decoded_group, group);
        assert_eq!(decoded, event);
        assert!(decoded.best_effort);
    }

    #[test]
    fn decode_rejects_foreign_channels_and_garbage() {
        let prefix = channel_prefix("chat");
        let user = GroupName::User(UserId::generate());
        let payload = serde_json::to_string(&FanoutEvent::durable("x", json!({}))).unwrap();

        assert!(decode(&prefix, &format!("other:fanout:{user}"), &payload).is_err());
        assert!(decode(&prefix, &format!("{prefix}room_1"), &payload).is_err());
        assert!(decode(&prefix, &format!("{prefix}{user}"), "not json").is_err());
    }
}
