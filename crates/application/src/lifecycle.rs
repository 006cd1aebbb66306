//! 消息生命周期管理
//!
//! 负责创建、编辑、删除和已读四种状态转换及其校验，每次成功转换返回一个 [`MessageEvent`]。
//! 这里不接触广播总线，由调用方（会话复用器）决定如何投递事件。

use std::sync::Arc;

use domain::{
    AttachmentDescriptor, Conversation, ConversationId, DomainError, Membership, Message,
    MessageEvent, MessageId, MessageText, MessageWindows, ReadReceipt, UserId,
};
use uuid::Uuid;

use crate::clock::Clock;
use crate::collaborators::{ContentDirectory, FollowGraph};
use crate::error::ApplicationError;
use crate::repository::{
    ConversationRepository, MembershipRepository, MessageRepository, ReadReceiptRepository,
};

/// 消息相关的可配置策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePolicy {
    pub windows: MessageWindows,
    pub max_text_len: usize,
}

impl Default for MessagePolicy {
    fn default() -> Self {
        Self {
            windows: MessageWindows::default(),
            max_text_len: 4000,
        }
    }
}

impl MessagePolicy {
    pub fn from_config(config: &config::ChatConfig) -> Self {
        Self {
            windows: MessageWindows {
                edit: chrono::Duration::seconds(config.edit_window_secs),
                delete: chrono::Duration::seconds(config.delete_window_secs),
            },
            max_text_len: config.max_text_len,
        }
    }
}

/// 创建消息的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub attachment: Option<AttachmentDescriptor>,
    pub reply_to: Option<MessageId>,
    pub shared_content_id: Option<Uuid>,
}

pub struct MessageLifecycleDependencies {
    pub conversation_repository: Arc<dyn ConversationRepository>,
    pub membership_repository: Arc<dyn MembershipRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub receipt_repository: Arc<dyn ReadReceiptRepository>,
    pub follow_graph: Arc<dyn FollowGraph>,
    pub content_directory: Arc<dyn ContentDirectory>,
    pub clock: Arc<dyn Clock>,
}

pub struct MessageLifecycleManager {
    deps: MessageLifecycleDependencies,
    policy: MessagePolicy,
}

impl MessageLifecycleManager {
    pub fn new(deps: MessageLifecycleDependencies, policy: MessagePolicy) -> Self {
        Self { deps, policy }
    }

    pub fn policy(&self) -> &MessagePolicy {
        &self.policy
    }

    /// 会话必须存在，且用户是未退出的成员
    pub async fn ensure_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(Conversation, Membership), ApplicationError> {
        let conversation = self
            .deps
            .conversation_repository
            .find_by_id(conversation_id)
            .await?
            .ok_or(DomainError::ConversationNotFound)?;

        let membership = self
            .deps
            .membership_repository
            .find(conversation_id, user_id)
            .await?
            .filter(Membership::is_active)
            .ok_or(DomainError::NotMember)?;

        Ok((conversation, membership))
    }

    pub async fn active_members(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Membership>, ApplicationError> {
        Ok(self
            .deps
            .membership_repository
            .list_active(conversation_id)
            .await?)
    }

    pub async fn create(&self, request: NewMessage) -> Result<MessageEvent, ApplicationError> {
        let (mut conversation, _) = self
            .ensure_member(request.conversation_id, request.sender_id)
            .await?;
        if !conversation.is_active {
            return Err(DomainError::ConversationInactive.into());
        }
        if conversation.is_direct() {
            self.ensure_sender_follows_peer(&conversation, request.sender_id)
                .await?;
        }

        let text = MessageText::new(request.text, self.policy.max_text_len)?;
        let now = self.deps.clock.now();
        let message = Message::compose(
            MessageId::generate(),
            conversation.id,
            request.sender_id,
            text,
            request.attachment,
            request.reply_to,
            request.shared_content_id,
            now,
        )?;

        if let Some(reply_to) = message.reply_to {
            let parent = self.deps.message_repository.find_by_id(reply_to).await?;
            if !parent.is_some_and(|p| p.conversation_id == conversation.id) {
                return Err(DomainError::MessageNotFound.into());
            }
        }

        if let Some(content_id) = message.shared_content_id {
            let exists = self
                .deps
                .content_directory
                .shared_content_exists(content_id)
                .await?;
            if !exists {
                return Err(DomainError::PostNotFound.into());
            }
        }

        let stored = self.deps.message_repository.create(message).await?;

        conversation.touch(now);
        self.deps
            .conversation_repository
            .update(conversation)
            .await?;

        tracing::debug!(
            message_id = %stored.id,
            conversation_id = %stored.conversation_id,
            sender_id = %stored.sender_id,
            "消息已创建"
        );

        Ok(MessageEvent::Created { message: stored })
    }

    pub async fn edit(
        &self,
        message_id: MessageId,
        editor: UserId,
        text: String,
    ) -> Result<MessageEvent, ApplicationError> {
        let mut message = self.find_owned(message_id, editor).await?;
        if message.is_deleted {
            return Err(DomainError::MessageAlreadyDeleted.into());
        }

        let text = MessageText::new(text, self.policy.max_text_len)?;
        let now = self.deps.clock.now();
        message.edit(editor, text, now, &self.policy.windows)?;
        let stored = self.deps.message_repository.update(message).await?;

        Ok(MessageEvent::Edited {
            message_id: stored.id,
            conversation_id: stored.conversation_id,
            sender_id: stored.sender_id,
            text: stored.text,
            edited_at: now,
        })
    }

    pub async fn delete(
        &self,
        message_id: MessageId,
        actor: UserId,
    ) -> Result<MessageEvent, ApplicationError> {
        let mut message = self.find_owned(message_id, actor).await?;

        let now = self.deps.clock.now();
        message.delete(actor, now, &self.policy.windows)?;
        let stored = self.deps.message_repository.update(message).await?;

        tracing::debug!(message_id = %stored.id, "消息已删除");

        Ok(MessageEvent::Deleted {
            message_id: stored.id,
            conversation_id: stored.conversation_id,
            sender_id: stored.sender_id,
            deleted_at: now,
        })
    }

    /// 带 message_id 时写单条回执，否则整个会话标记已读
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: Option<MessageId>,
    ) -> Result<MessageEvent, ApplicationError> {
        let (_, mut membership) = self.ensure_member(conversation_id, user_id).await?;
        let now = self.deps.clock.now();

        match message_id {
            Some(message_id) => {
                let message = self
                    .deps
                    .message_repository
                    .find_by_id(message_id)
                    .await?
                    .filter(|m| m.conversation_id == conversation_id)
                    .ok_or(DomainError::MessageNotFound)?;

                self.deps
                    .receipt_repository
                    .upsert(ReadReceipt {
                        message_id,
                        user_id,
                        read_at: now,
                    })
                    .await?;
                membership.mark_read(message.created_at);
            }
            None => membership.mark_read(now),
        }

        self.deps.membership_repository.upsert(membership).await?;

        Ok(MessageEvent::Read {
            conversation_id,
            user_id,
            message_id,
            read_at: now,
        })
    }

    // 私聊只允许发送者关注了对方时发消息
    async fn ensure_sender_follows_peer(
        &self,
        conversation: &Conversation,
        sender: UserId,
    ) -> Result<(), ApplicationError> {
        let members = self
            .deps
            .membership_repository
            .list_active(conversation.id)
            .await?;
        let peer = members
            .iter()
            .map(|m| m.user_id)
            .find(|id| *id != sender)
            .ok_or(DomainError::OperationNotAllowed)?;

        if !self.deps.follow_graph.is_following(sender, peer).await? {
            return Err(DomainError::NoFollowRelationship.into());
        }
        Ok(())
    }

    // 先找消息再校验所有权，非发送者一律得到 UNAUTHORIZED；已退出会话的发送者得到 NOT_MEMBER
    async fn find_owned(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<Message, ApplicationError> {
        let message = self
            .deps
            .message_repository
            .find_by_id(message_id)
            .await?
            .ok_or(DomainError::MessageNotFound)?;

        if message.sender_id != user_id {
            return Err(DomainError::NotMessageOwner.into());
        }
        self.ensure_member(message.conversation_id, user_id).await?;
        Ok(message)
    }
}
