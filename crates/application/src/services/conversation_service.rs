//! 会话管理与只读视图
//!
//! 私聊 / 群聊的创建、加人、退出、解散，以及收件箱和会话详情两个查询。

use std::sync::Arc;

use domain::{Conversation, ConversationId, DomainError, Membership, MessageId, UserId};
use serde_json::json;

use crate::{
    clock::Clock,
    collaborators::UserDirectory,
    dto::{ConversationDetail, CreateGroupRequest, InboxEntry, MemberView},
    error::{ApplicationError, AuthError},
    fanout::{FanoutBus, FanoutEvent, GroupName},
    presence::PresenceTracker,
    repository::{ConversationRepository, MembershipRepository, MessageRepository},
};

/// 会话被解散后发给每个前成员的个人分组，收到的会话据此退订会话分组
pub const CONVERSATION_DEACTIVATED_EVENT: &str = "conversation.deactivated";

pub struct ConversationServiceDependencies {
    pub conversation_repository: Arc<dyn ConversationRepository>,
    pub membership_repository: Arc<dyn MembershipRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub user_directory: Arc<dyn UserDirectory>,
    pub presence: Arc<dyn PresenceTracker>,
    pub bus: Arc<dyn FanoutBus>,
    pub clock: Arc<dyn Clock>,
}

pub struct ConversationService {
    deps: ConversationServiceDependencies,
    history_page_size: u32,
}

impl ConversationService {
    pub fn new(deps: ConversationServiceDependencies, history_page_size: u32) -> Self {
        Self {
            deps,
            history_page_size,
        }
    }

    async fn find_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ApplicationError> {
        Ok(self
            .deps
            .conversation_repository
            .find_by_id(conversation_id)
            .await?
            .ok_or(DomainError::ConversationNotFound)?)
    }

    async fn active_membership(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Membership, ApplicationError> {
        Ok(self
            .deps
            .membership_repository
            .find(conversation_id, user_id)
            .await?
            .filter(Membership::is_active)
            .ok_or(DomainError::NotMember)?)
    }

    async fn ensure_user_exists(&self, user_id: UserId) -> Result<(), ApplicationError> {
        let profile = self.deps.user_directory.find_profile(user_id).await?;
        if !profile.is_some_and(|p| p.is_active) {
            return Err(AuthError::UserNotFound.into());
        }
        Ok(())
    }

    /// 两人之间已有有效私聊时直接复用
    pub async fn create_direct(
        &self,
        creator: UserId,
        other: UserId,
    ) -> Result<Conversation, ApplicationError> {
        if creator == other {
            return Err(DomainError::invalid_argument(
                "user_id",
                "cannot start a conversation with yourself",
            )
            .into());
        }
        self.ensure_user_exists(other).await?;

        if let Some(existing) = self
            .deps
            .conversation_repository
            .find_direct(creator, other)
            .await?
        {
            return Ok(existing);
        }

        let now = self.deps.clock.now();
        let conversation = self
            .deps
            .conversation_repository
            .create(Conversation::new_direct(
                ConversationId::generate(),
                creator,
                now,
            ))
            .await?;

        for user_id in [creator, other] {
            self.deps
                .membership_repository
                .upsert(Membership::new(conversation.id, user_id, false, now))
                .await?;
        }

        tracing::info!(
            conversation_id = %conversation.id,
            creator_id = %creator,
            "私聊已创建"
        );
        Ok(conversation)
    }

    pub async fn create_group(
        &self,
        creator: UserId,
        request: CreateGroupRequest,
    ) -> Result<Conversation, ApplicationError> {
        let now = self.deps.clock.now();
        let conversation = Conversation::new_group(
            ConversationId::generate(),
            request.name,
            request.description,
            creator,
            now,
        )?;

        let mut member_ids: Vec<UserId> = Vec::new();
        for user_id in request.member_ids {
            if user_id == creator || member_ids.contains(&user_id) {
                continue;
            }
            self.ensure_user_exists(user_id).await?;
            member_ids.push(user_id);
        }

        let conversation = self
            .deps
            .conversation_repository
            .create(conversation)
            .await?;

        self.deps
            .membership_repository
            .upsert(Membership::new(conversation.id, creator, true, now))
            .await?;
        for user_id in &member_ids {
            self.deps
                .membership_repository
                .upsert(Membership::new(conversation.id, *user_id, false, now))
                .await?;
        }

        tracing::info!(
            conversation_id = %conversation.id,
            creator_id = %creator,
            member_count = member_ids.len() + 1,
            "群聊已创建"
        );
        Ok(conversation)
    }

    /// 只有群管理员能加人。曾经退出的用户重新加入，已在群里的跳过。
    pub async fn add_members(
        &self,
        conversation_id: ConversationId,
        actor: UserId,
        user_ids: Vec<UserId>,
    ) -> Result<Vec<Membership>, ApplicationError> {
        let conversation = self.find_conversation(conversation_id).await?;
        if conversation.is_direct() {
            return Err(DomainError::OperationNotAllowed.into());
        }
        if !conversation.is_active {
            return Err(DomainError::ConversationInactive.into());
        }

        let membership = self.active_membership(conversation_id, actor).await?;
        if !membership.is_admin {
            return Err(DomainError::OperationNotAllowed.into());
        }

        let now = self.deps.clock.now();
        let mut added = Vec::new();
        for user_id in user_ids {
            self.ensure_user_exists(user_id).await?;
            let existing = self
                .deps
                .membership_repository
                .find(conversation_id, user_id)
                .await?;

            let membership = match existing {
                Some(membership) if membership.is_active() => continue,
                Some(mut membership) => {
                    membership.rejoin(now);
                    membership
                }
                None => Membership::new(conversation_id, user_id, false, now),
            };
            added.push(self.deps.membership_repository.upsert(membership).await?);
        }

        tracing::info!(
            conversation_id = %conversation_id,
            actor_id = %actor,
            added = added.len(),
            "成员已加入"
        );
        Ok(added)
    }

    /// 私聊始终保持两名成员，不允许退出
    pub async fn leave(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Membership, ApplicationError> {
        let conversation = self.find_conversation(conversation_id).await?;
        let mut membership = self.active_membership(conversation_id, user_id).await?;
        if conversation.is_direct() {
            return Err(DomainError::OperationNotAllowed.into());
        }

        membership.leave(self.deps.clock.now());
        let membership = self.deps.membership_repository.upsert(membership).await?;

        tracing::info!(conversation_id = %conversation_id, user_id = %user_id, "成员已退出");
        Ok(membership)
    }

    /// 创建者或管理员解散会话，所有当前成员随之退出
    pub async fn deactivate(
        &self,
        conversation_id: ConversationId,
        actor: UserId,
    ) -> Result<Conversation, ApplicationError> {
        let mut conversation = self.find_conversation(conversation_id).await?;
        if !conversation.is_active {
            return Err(DomainError::ConversationInactive.into());
        }

        let membership = self.active_membership(conversation_id, actor).await?;
        if conversation.created_by != actor && !membership.is_admin {
            return Err(DomainError::OperationNotAllowed.into());
        }

        let now = self.deps.clock.now();
        let members = self
            .deps
            .membership_repository
            .list_active(conversation_id)
            .await?;
        let mut former_members = Vec::with_capacity(members.len());
        for mut member in members {
            member.leave(now);
            former_members.push(member.user_id);
            self.deps.membership_repository.upsert(member).await?;
        }

        conversation.deactivate(now);
        let conversation = self
            .deps
            .conversation_repository
            .update(conversation)
            .await?;

        tracing::info!(conversation_id = %conversation_id, actor_id = %actor, "会话已解散");
        self.announce_deactivation(&conversation, &former_members)
            .await;
        Ok(conversation)
    }

    // 投递失败只记日志，解散本身已经落库
    async fn announce_deactivation(&self, conversation: &Conversation, former_members: &[UserId]) {
        let event = FanoutEvent::durable(
            CONVERSATION_DEACTIVATED_EVENT,
            json!({
                "conversation_id": conversation.id,
                "deactivated_at": conversation.updated_at,
            }),
        );
        for user_id in former_members {
            if let Err(err) = self
                .deps
                .bus
                .publish(GroupName::User(*user_id), event.clone())
                .await
            {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    user_id = %user_id,
                    error = %err,
                    "解散通知投递失败"
                );
            }
        }
    }

    /// 用户所在的全部会话，最近活跃的在前
    pub async fn inbox(&self, user_id: UserId) -> Result<Vec<InboxEntry>, ApplicationError> {
        let memberships = self
            .deps
            .membership_repository
            .list_active_for_user(user_id)
            .await?;

        let mut entries = Vec::with_capacity(memberships.len());
        for membership in memberships {
            let Some(conversation) = self
                .deps
                .conversation_repository
                .find_by_id(membership.conversation_id)
                .await?
            else {
                tracing::warn!(
                    conversation_id = %membership.conversation_id,
                    "成员关系指向不存在的会话"
                );
                continue;
            };

            let last_message = self
                .deps
                .message_repository
                .latest(conversation.id)
                .await?;
            let unread_count = self
                .deps
                .message_repository
                .count_unread(conversation.id, user_id, membership.last_read_at)
                .await?;

            entries.push(InboxEntry {
                conversation,
                last_message,
                unread_count,
            });
        }

        entries.sort_by(|a, b| b.conversation.updated_at.cmp(&a.conversation.updated_at));
        Ok(entries)
    }

    /// 成员列表加一页历史消息，`before` 为游标
    pub async fn detail(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        before: Option<MessageId>,
        limit: Option<u32>,
    ) -> Result<ConversationDetail, ApplicationError> {
        let conversation = self.find_conversation(conversation_id).await?;
        self.active_membership(conversation_id, user_id).await?;

        let memberships = self
            .deps
            .membership_repository
            .list_active(conversation_id)
            .await?;
        let mut members = Vec::with_capacity(memberships.len());
        for membership in memberships {
            members.push(self.member_view(&membership).await?);
        }

        let limit = limit
            .unwrap_or(self.history_page_size)
            .clamp(1, self.history_page_size);
        let mut messages = self
            .deps
            .message_repository
            .list_recent(conversation_id, limit + 1, before)
            .await?;
        let has_more = messages.len() > limit as usize;
        messages.truncate(limit as usize);

        Ok(ConversationDetail {
            conversation,
            members,
            messages,
            has_more,
        })
    }

    async fn member_view(&self, membership: &Membership) -> Result<MemberView, ApplicationError> {
        let user_id = membership.user_id;
        let profile = self.deps.user_directory.find_profile(user_id).await?;
        let online = self.deps.presence.is_online(user_id).await?;
        let last_seen = self.deps.presence.last_seen(user_id).await?;

        let (display_name, avatar_url) = match profile {
            Some(profile) => (profile.display_name, profile.avatar_url),
            None => (user_id.to_string(), None),
        };

        Ok(MemberView {
            user_id,
            display_name,
            avatar_url,
            is_admin: membership.is_admin,
            online,
            last_seen,
        })
    }
}
