//! 会话复用器
//!
//! 每个已认证的连接对应一个 [`SessionMultiplexer`]。它记录当前订阅的分组（始终包含个人分组），
//! 把入站动作翻译成对限流器、消息生命周期、在线状态的调用，并把结果发布到广播总线。
//!
//! 断开时必须释放全部订阅并标记离线。正常路径调用 [`SessionMultiplexer::close`]；
//! 异常退出时由 `Drop` 在当前运行时上补做清理。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use domain::{ConversationId, MessageEvent, UserId};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::dto::{ConversationPresence, PresenceView};
use crate::error::ApplicationError;
use crate::fanout::{FanoutBus, FanoutEvent, GroupName, SessionId, SessionSink, SubscriptionHandle};
use crate::lifecycle::{MessageLifecycleManager, NewMessage};
use crate::pool::PersistencePool;
use crate::presence::PresenceTracker;
use crate::protocol::{
    Ack, ClientAction, ConversationRefPayload, EditMessagePayload, InboundFrame, MarkReadPayload,
    MessageRefPayload, SendMessagePayload, TypingPayload,
};
use crate::rate_limiter::RateLimiter;
use crate::services::CONVERSATION_DEACTIVATED_EVENT;

pub const SEND_MESSAGE_ACTION: &str = "send_message";
pub const TYPING_EVENT: &str = "typing.update";
pub const INBOX_EVENT: &str = "inbox.updated";

/// 所有会话共享的服务
pub struct SessionServices {
    pub lifecycle: Arc<MessageLifecycleManager>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub presence: Arc<dyn PresenceTracker>,
    pub bus: Arc<dyn FanoutBus>,
    pub pool: PersistencePool,
    pub send_rate_max: u32,
    pub send_rate_window: Duration,
}

pub struct SessionMultiplexer {
    user_id: UserId,
    sink: SessionSink,
    subscriptions: HashMap<GroupName, SubscriptionHandle>,
    services: Arc<SessionServices>,
    closed: bool,
}

impl SessionMultiplexer {
    /// 创建会话并订阅用户的个人分组
    pub async fn start(
        user_id: UserId,
        sink: SessionSink,
        services: Arc<SessionServices>,
    ) -> Result<Self, ApplicationError> {
        let mut session = Self {
            user_id,
            sink,
            subscriptions: HashMap::new(),
            services,
            closed: false,
        };
        session.subscribe(GroupName::User(user_id)).await?;
        Ok(session)
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn session_id(&self) -> SessionId {
        self.sink.id()
    }

    /// 出站队列溢出导致驱逐时触发
    pub fn eviction(&self) -> CancellationToken {
        self.sink.eviction()
    }

    pub fn is_subscribed(&self, group: GroupName) -> bool {
        self.subscriptions.contains_key(&group)
    }

    /// 只发给本会话，不经过总线
    pub fn deliver_direct(&self, event: &FanoutEvent) {
        self.sink.deliver(event);
    }

    /// 总线事件写给客户端之前先经过这里；会话被解散时退订对应的会话分组
    pub async fn observe(&mut self, event: &FanoutEvent) {
        if event.event_type != CONVERSATION_DEACTIVATED_EVENT {
            return;
        }
        let conversation_id = event
            .data
            .get("conversation_id")
            .cloned()
            .and_then(|value| serde_json::from_value::<ConversationId>(value).ok());
        match conversation_id {
            Some(conversation_id) => {
                self.unsubscribe(GroupName::Conversation(conversation_id))
                    .await;
            }
            None => tracing::warn!(user_id = %self.user_id, "解散事件缺少会话 id"),
        }
    }

    /// 处理一个入站帧。任何错误都变成失败回执，连接保持可用。
    pub async fn handle(&mut self, raw: &str) -> Ack {
        let frame = match InboundFrame::parse(raw) {
            Ok(frame) => frame,
            Err(rejected) => {
                let err = ApplicationError::from(rejected.error);
                tracing::debug!(user_id = %self.user_id, error = %err, "入站帧无法解析");
                return Ack::failure("", rejected.request_id, err.code(), err.public_message());
            }
        };

        let result = match ClientAction::decode(&frame) {
            Ok(action) => self.dispatch(action).await,
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(data) => Ack::success(frame.action, frame.request_id, data),
            Err(err) => {
                if err.kind().is_expected() {
                    tracing::debug!(
                        user_id = %self.user_id,
                        action = %frame.action,
                        error = %err,
                        "请求被拒绝"
                    );
                } else {
                    tracing::error!(
                        user_id = %self.user_id,
                        action = %frame.action,
                        error = %err,
                        "请求处理失败"
                    );
                }
                Ack::failure(
                    frame.action,
                    frame.request_id,
                    err.code(),
                    err.public_message(),
                )
            }
        }
    }

    async fn dispatch(&mut self, action: ClientAction) -> Result<Option<Value>, ApplicationError> {
        match action {
            ClientAction::SendMessage(payload) => self.send_message(payload).await,
            ClientAction::EditMessage(payload) => self.edit_message(payload).await,
            ClientAction::DeleteMessage(payload) => self.delete_message(payload).await,
            ClientAction::MarkRead(payload) => self.mark_read(payload).await,
            ClientAction::JoinConversation(payload) => self.join(payload).await,
            ClientAction::LeaveConversation(payload) => self.leave(payload).await,
            ClientAction::Typing(payload) => self.typing(payload).await,
            ClientAction::GetPresence(payload) => self.presence(payload).await,
        }
    }

    async fn send_message(
        &mut self,
        payload: SendMessagePayload,
    ) -> Result<Option<Value>, ApplicationError> {
        let services = self.services.clone();
        let decision = services
            .rate_limiter
            .allow(
                self.user_id,
                SEND_MESSAGE_ACTION,
                services.send_rate_max,
                services.send_rate_window,
            )
            .await?;
        if !decision.allowed {
            return Err(ApplicationError::RateLimited {
                action: SEND_MESSAGE_ACTION.to_string(),
            });
        }

        let request = NewMessage {
            conversation_id: payload.conversation_id,
            sender_id: self.user_id,
            text: payload.text,
            attachment: payload.attachment,
            reply_to: payload.reply_to,
            shared_content_id: payload.shared_content_id,
        };
        let event = services
            .pool
            .run("create_message", services.lifecycle.create(request))
            .await?;

        let group = GroupName::Conversation(event.conversation_id());
        if let Err(err) = self.subscribe(group).await {
            tracing::warn!(user_id = %self.user_id, group = %group, error = %err, "订阅会话分组失败");
        }

        let data = self.broadcast(&event).await?;
        self.ping_inboxes(&event).await;
        Ok(Some(data))
    }

    async fn edit_message(
        &mut self,
        payload: EditMessagePayload,
    ) -> Result<Option<Value>, ApplicationError> {
        let services = self.services.clone();
        let event = services
            .pool
            .run(
                "edit_message",
                services
                    .lifecycle
                    .edit(payload.message_id, self.user_id, payload.text),
            )
            .await?;
        Ok(Some(self.broadcast(&event).await?))
    }

    async fn delete_message(
        &mut self,
        payload: MessageRefPayload,
    ) -> Result<Option<Value>, ApplicationError> {
        let services = self.services.clone();
        let event = services
            .pool
            .run(
                "delete_message",
                services.lifecycle.delete(payload.message_id, self.user_id),
            )
            .await?;
        Ok(Some(self.broadcast(&event).await?))
    }

    async fn mark_read(
        &mut self,
        payload: MarkReadPayload,
    ) -> Result<Option<Value>, ApplicationError> {
        let services = self.services.clone();
        let event = services
            .pool
            .run(
                "mark_read",
                services.lifecycle.mark_read(
                    payload.conversation_id,
                    self.user_id,
                    payload.message_id,
                ),
            )
            .await?;
        Ok(Some(self.broadcast(&event).await?))
    }

    async fn join(
        &mut self,
        payload: ConversationRefPayload,
    ) -> Result<Option<Value>, ApplicationError> {
        self.ensure_member(payload.conversation_id).await?;
        self.subscribe(GroupName::Conversation(payload.conversation_id))
            .await?;
        Ok(Some(json!({ "conversation_id": payload.conversation_id })))
    }

    /// 即使已经不是成员也要退订，避免继续收到广播
    async fn leave(
        &mut self,
        payload: ConversationRefPayload,
    ) -> Result<Option<Value>, ApplicationError> {
        let membership = self.ensure_member(payload.conversation_id).await;
        self.unsubscribe(GroupName::Conversation(payload.conversation_id))
            .await;
        membership?;
        Ok(Some(json!({ "conversation_id": payload.conversation_id })))
    }

    async fn typing(&mut self, payload: TypingPayload) -> Result<Option<Value>, ApplicationError> {
        self.ensure_member(payload.conversation_id).await?;
        let event = FanoutEvent::best_effort(
            TYPING_EVENT,
            json!({
                "conversation_id": payload.conversation_id,
                "user_id": self.user_id,
                "is_typing": payload.is_typing,
            }),
        );
        self.publish(GroupName::Conversation(payload.conversation_id), event)
            .await;
        Ok(None)
    }

    async fn presence(
        &mut self,
        payload: ConversationRefPayload,
    ) -> Result<Option<Value>, ApplicationError> {
        self.ensure_member(payload.conversation_id).await?;
        let services = self.services.clone();
        let memberships = services
            .pool
            .run(
                "list_members",
                services.lifecycle.active_members(payload.conversation_id),
            )
            .await?;

        let mut members = Vec::with_capacity(memberships.len());
        for membership in memberships {
            let user_id = membership.user_id;
            members.push(PresenceView {
                user_id,
                online: services.presence.is_online(user_id).await?,
                last_seen: services.presence.last_seen(user_id).await?,
            });
        }

        let presence = ConversationPresence {
            conversation_id: payload.conversation_id,
            members,
        };
        Ok(Some(serde_json::to_value(presence).map_err(|err| {
            ApplicationError::infrastructure_with_source("failed to encode presence", err)
        })?))
    }

    async fn ensure_member(&self, conversation_id: ConversationId) -> Result<(), ApplicationError> {
        let services = self.services.clone();
        services
            .pool
            .run(
                "ensure_member",
                services.lifecycle.ensure_member(conversation_id, self.user_id),
            )
            .await?;
        Ok(())
    }

    // 发布生命周期事件，返回同时作为回执数据的事件内容
    async fn broadcast(&self, event: &MessageEvent) -> Result<Value, ApplicationError> {
        let broadcast = FanoutEvent::from_message_event(event)?;
        let data = broadcast.data.clone();
        self.publish(GroupName::Conversation(event.conversation_id()), broadcast)
            .await;
        Ok(data)
    }

    // 私信到达时刷新其他成员的收件箱，不要求他们已加入会话分组
    async fn ping_inboxes(&self, event: &MessageEvent) {
        let MessageEvent::Created { message } = event else {
            return;
        };
        let services = self.services.clone();
        let members = match services
            .pool
            .run(
                "list_members",
                services.lifecycle.active_members(message.conversation_id),
            )
            .await
        {
            Ok(members) => members,
            Err(err) => {
                tracing::warn!(conversation_id = %message.conversation_id, error = %err, "读取成员失败，跳过收件箱刷新");
                return;
            }
        };

        let ping = FanoutEvent::best_effort(
            INBOX_EVENT,
            json!({
                "conversation_id": message.conversation_id,
                "message_id": message.id,
                "sender_id": message.sender_id,
            }),
        );
        for member in members.iter().filter(|m| m.user_id != self.user_id) {
            self.publish(GroupName::User(member.user_id), ping.clone())
                .await;
        }
    }

    // 消息已经落库，发布失败只记录，不改变回执结果
    async fn publish(&self, group: GroupName, event: FanoutEvent) {
        if let Err(err) = self.services.bus.publish(group, event).await {
            tracing::error!(user_id = %self.user_id, group = %group, error = %err, "广播发布失败");
        }
    }

    async fn subscribe(&mut self, group: GroupName) -> Result<(), ApplicationError> {
        if self.subscriptions.contains_key(&group) {
            return Ok(());
        }
        let handle = self
            .services
            .bus
            .subscribe(group, self.sink.clone())
            .await?;
        self.subscriptions.insert(group, handle);
        tracing::debug!(user_id = %self.user_id, group = %group, "已订阅分组");
        Ok(())
    }

    async fn unsubscribe(&mut self, group: GroupName) {
        if let Some(handle) = self.subscriptions.remove(&group) {
            if let Err(err) = self.services.bus.unsubscribe(handle).await {
                tracing::warn!(user_id = %self.user_id, group = %group, error = %err, "退订分组失败");
            }
        }
    }

    /// 断开连接：退订全部分组并标记离线
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let handles: Vec<SubscriptionHandle> =
            self.subscriptions.drain().map(|(_, handle)| handle).collect();
        release(self.services.clone(), self.user_id, handles).await;
    }
}

impl Drop for SessionMultiplexer {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let handles: Vec<SubscriptionHandle> =
            self.subscriptions.drain().map(|(_, handle)| handle).collect();
        let services = self.services.clone();
        let user_id = self.user_id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(release(services, user_id, handles));
            }
            Err(_) => {
                tracing::error!(user_id = %user_id, "没有可用的运行时，会话订阅未能释放");
            }
        }
    }
}

async fn release(services: Arc<SessionServices>, user_id: UserId, handles: Vec<SubscriptionHandle>) {
    for handle in handles {
        if let Err(err) = services.bus.unsubscribe(handle).await {
            tracing::warn!(user_id = %user_id, group = %handle.group, error = %err, "退订分组失败");
        }
    }
    if let Err(err) = services.presence.mark_offline(user_id).await {
        tracing::warn!(user_id = %user_id, error = %err, "标记离线失败");
    }
    tracing::debug!(user_id = %user_id, "会话资源已释放");
}
