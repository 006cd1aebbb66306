//! 广播总线
//!
//! 两类分组：`conversation_<id>` 投递给加入该会话的所有会话连接，`user_<id>` 投递给某个用户的全部连接。
//! 同一分组内按发布顺序投递，分组之间不保证顺序。
//!
//! 每个连接持有一个有界出站队列（[`SessionSink`]）。队列满时尽力而为的事件直接丢弃，
//! 持久事件无法入队则驱逐该连接，由客户端重连后从历史补齐。

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use domain::{ConversationId, MessageEvent, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupName {
    Conversation(ConversationId),
    User(UserId),
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupName::Conversation(id) => write!(f, "conversation_{id}"),
            GroupName::User(id) => write!(f, "user_{id}"),
        }
    }
}

impl FromStr for GroupName {
    type Err = FanoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || FanoutError::InvalidGroup(value.to_string());
        if let Some(id) = value.strip_prefix("conversation_") {
            let id = Uuid::parse_str(id).map_err(|_| invalid())?;
            return Ok(GroupName::Conversation(ConversationId::from(id)));
        }
        if let Some(id) = value.strip_prefix("user_") {
            let id = Uuid::parse_str(id).map_err(|_| invalid())?;
            return Ok(GroupName::User(UserId::from(id)));
        }
        Err(invalid())
    }
}

/// 广播事件，出站时序列化为 `{"type": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    /// 已读回执、输入状态这类提示性事件，背压下可以丢弃
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub best_effort: bool,
}

impl FanoutEvent {
    pub fn durable(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            best_effort: false,
        }
    }

    pub fn best_effort(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            best_effort: true,
        }
    }

    pub fn from_message_event(event: &MessageEvent) -> Result<Self, FanoutError> {
        let data = serde_json::to_value(event)?;
        Ok(Self {
            event_type: event.event_type().to_string(),
            data,
            best_effort: event.is_best_effort(),
        })
    }

    /// 客户端看到的帧，不含内部的 best_effort 标记
    pub fn to_frame(&self) -> Result<String, FanoutError> {
        let frame = serde_json::json!({
            "type": self.event_type,
            "data": self.data,
        });
        Ok(serde_json::to_string(&frame)?)
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("invalid group name: {0}")]
    InvalidGroup(String),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish failed: {0}")]
    Publish(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Queued,
    /// 队列已满，提示性事件被丢弃
    Dropped,
    /// 队列已满，持久事件无法投递，连接被驱逐
    Evicted,
    Closed,
}

/// 单个连接的出站端
#[derive(Debug, Clone)]
pub struct SessionSink {
    id: SessionId,
    sender: mpsc::Sender<FanoutEvent>,
    eviction: CancellationToken,
}

impl SessionSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FanoutEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let sink = Self {
            id: SessionId::generate(),
            sender,
            eviction: CancellationToken::new(),
        };
        (sink, receiver)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// 连接被驱逐时触发
    pub fn eviction(&self) -> CancellationToken {
        self.eviction.clone()
    }

    pub fn deliver(&self, event: &FanoutEvent) -> DeliveryOutcome {
        match self.sender.try_send(event.clone()) {
            Ok(()) => DeliveryOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) if event.best_effort => {
                DeliveryOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.eviction.cancel();
                DeliveryOutcome::Evicted
            }
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Closed,
        }
    }
}

/// 进程内的分组路由表，本地总线和跨进程总线共用
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    groups: RwLock<HashMap<GroupName, HashMap<SessionId, SessionSink>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, group: GroupName, sink: SessionSink) {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups.entry(group).or_default().insert(sink.id(), sink);
    }

    pub fn unsubscribe(&self, group: GroupName, session_id: SessionId) {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(members) = groups.get_mut(&group) {
            members.remove(&session_id);
            if members.is_empty() {
                groups.remove(&group);
            }
        }
    }

    /// 投递给分组内所有本地连接，返回成功入队的数量
    pub fn route(&self, group: GroupName, event: &FanoutEvent) -> usize {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = groups.get(&group) else {
            return 0;
        };

        let mut queued = 0;
        for sink in members.values() {
            match sink.deliver(event) {
                DeliveryOutcome::Queued => queued += 1,
                DeliveryOutcome::Dropped => {
                    tracing::debug!(
                        group = %group,
                        session_id = %sink.id(),
                        event_type = %event.event_type,
                        "出站队列已满，丢弃提示性事件"
                    );
                }
                DeliveryOutcome::Evicted => {
                    tracing::warn!(
                        group = %group,
                        session_id = %sink.id(),
                        event_type = %event.event_type,
                        "出站队列已满，驱逐慢连接"
                    );
                }
                DeliveryOutcome::Closed => {}
            }
        }
        queued
    }

    pub fn subscriber_count(&self, group: GroupName) -> usize {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.get(&group).map_or(0, HashMap::len)
    }
}

/// 订阅句柄，退订时交回
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub group: GroupName,
    pub session_id: SessionId,
}

#[async_trait]
pub trait FanoutBus: Send + Sync {
    async fn publish(&self, group: GroupName, event: FanoutEvent) -> Result<(), FanoutError>;

    async fn subscribe(
        &self,
        group: GroupName,
        sink: SessionSink,
    ) -> Result<SubscriptionHandle, FanoutError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), FanoutError>;
}

/// 单进程总线，直接在本地路由表上投递
#[derive(Debug, Clone, Default)]
pub struct LocalFanoutBus {
    registry: Arc<SubscriptionRegistry>,
}

impl LocalFanoutBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }
}

#[async_trait]
impl FanoutBus for LocalFanoutBus {
    async fn publish(&self, group: GroupName, event: FanoutEvent) -> Result<(), FanoutError> {
        self.registry.route(group, &event);
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
