use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, FetchCheckpoint, FetchCursor, Membership, Message, MessageId,
    Notification, NotificationDraft, ReadReceipt, RepositoryError, Timestamp, UserId,
};

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError>;
    async fn update(&self, conversation: Conversation) -> Result<Conversation, RepositoryError>;
    async fn find_by_id(&self, id: ConversationId)
        -> Result<Option<Conversation>, RepositoryError>;
    // 两个用户之间仍然有效的私聊
    async fn find_direct(
        &self,
        first: UserId,
        second: UserId,
    ) -> Result<Option<Conversation>, RepositoryError>;
}

#[async_trait]
pub trait MembershipRepository: Send + Sync {
    // (conversation, user) 唯一，已存在则覆盖
    async fn upsert(&self, membership: Membership) -> Result<Membership, RepositoryError>;
    async fn find(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Membership>, RepositoryError>;
    async fn list_active(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Membership>, RepositoryError>;
    async fn list_active_for_user(&self, user_id: UserId)
        -> Result<Vec<Membership>, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError>;
    async fn update(&self, message: Message) -> Result<Message, RepositoryError>;
    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    // 按创建时间倒序，before 为游标（不含）
    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn latest(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Message>, RepositoryError>;

    // 他人发送、未删除、创建时间晚于 since 的消息数
    async fn count_unread(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
        since: Option<Timestamp>,
    ) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait ReadReceiptRepository: Send + Sync {
    // (message, user) 唯一，重复标记只保留最早的时间
    async fn upsert(&self, receipt: ReadReceipt) -> Result<ReadReceipt, RepositoryError>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn insert(&self, notification: Notification) -> Result<Notification, RepositoryError>;

    /// 原子地合并到 (recipient, type, target) 在窗口内的已有通知，找不到则新建
    ///
    /// 并发的两次点赞不能各自新建一行，实现必须在存储层串行化同一聚合键。
    async fn upsert_aggregated(
        &self,
        draft: NotificationDraft,
        window: chrono::Duration,
        now: Timestamp,
    ) -> Result<Notification, RepositoryError>;

    /// 位于 `after` 之后且 `created_at <= until` 的通知，按 `(created_at, id)` 升序
    async fn list_created_after(
        &self,
        recipient: UserId,
        after: FetchCursor,
        until: Timestamp,
        limit: u32,
    ) -> Result<Vec<Notification>, RepositoryError>;

    async fn find_checkpoint(&self, user_id: UserId) -> Result<FetchCheckpoint, RepositoryError>;

    /// 只前进不后退，返回前进后的检查点
    async fn advance_checkpoint(
        &self,
        user_id: UserId,
        to: FetchCursor,
    ) -> Result<FetchCheckpoint, RepositoryError>;
}
