//! 进程内仓储与协作者实现
//!
//! 用于单元测试、Web 层集成测试以及没有数据库的本地试运行。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, ConversationKind, FetchCheckpoint, FetchCursor, Membership,
    Message, MessageId, Notification, NotificationDraft, NotificationId, ReadReceipt,
    RepositoryError, Timestamp, UserId,
};
use uuid::Uuid;

use crate::collaborators::{
    ContentDirectory, FollowGraph, ObjectStorage, StorageError, UserDirectory, UserProfile,
};
use crate::repository::{
    ConversationRepository, MembershipRepository, MessageRepository, NotificationRepository,
    ReadReceiptRepository,
};

#[derive(Default)]
pub struct MemoryMembershipRepository {
    rows: RwLock<HashMap<(ConversationId, UserId), Membership>>,
}

impl MemoryMembershipRepository {
    fn is_active_member(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.get(&(conversation_id, user_id))
            .is_some_and(Membership::is_active)
    }
}

#[async_trait]
impl MembershipRepository for MemoryMembershipRepository {
    async fn upsert(&self, membership: Membership) -> Result<Membership, RepositoryError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        rows.insert(
            (membership.conversation_id, membership.user_id),
            membership.clone(),
        );
        Ok(membership)
    }

    async fn find(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Membership>, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(&(conversation_id, user_id)).cloned())
    }

    async fn list_active(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Membership>, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut members: Vec<Membership> = rows
            .values()
            .filter(|m| m.conversation_id == conversation_id && m.is_active())
            .cloned()
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    async fn list_active_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Membership>, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .values()
            .filter(|m| m.user_id == user_id && m.is_active())
            .cloned()
            .collect())
    }
}

pub struct MemoryConversationRepository {
    rows: RwLock<HashMap<ConversationId, Conversation>>,
    memberships: Arc<MemoryMembershipRepository>,
}

impl MemoryConversationRepository {
    pub fn new(memberships: Arc<MemoryMembershipRepository>) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            memberships,
        }
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationRepository {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        if rows.contains_key(&conversation.id) {
            return Err(RepositoryError::Conflict);
        }
        rows.insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn update(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        match rows.get_mut(&conversation.id) {
            Some(row) => {
                *row = conversation.clone();
                Ok(conversation)
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(&id).cloned())
    }

    async fn find_direct(
        &self,
        first: UserId,
        second: UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .values()
            .filter(|c| c.kind == ConversationKind::Direct && c.is_active)
            .find(|c| {
                self.memberships.is_active_member(c.id, first)
                    && self.memberships.is_active_member(c.id, second)
            })
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryMessageRepository {
    rows: RwLock<HashMap<MessageId, Message>>,
}

fn newest_first(a: &Message, b: &Message) -> std::cmp::Ordering {
    (b.created_at, b.id).cmp(&(a.created_at, a.id))
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        if rows.contains_key(&message.id) {
            return Err(RepositoryError::Conflict);
        }
        rows.insert(message.id, message.clone());
        Ok(message)
    }

    async fn update(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        match rows.get_mut(&message.id) {
            Some(row) => {
                *row = message.clone();
                Ok(message)
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(&id).cloned())
    }

    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let cursor = match before {
            Some(id) => match rows.get(&id) {
                Some(m) => Some((m.created_at, m.id)),
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        let mut messages: Vec<Message> = rows
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| cursor.map_or(true, |c| (m.created_at, m.id) < c))
            .cloned()
            .collect();
        messages.sort_by(newest_first);
        messages.truncate(limit as usize);
        Ok(messages)
    }

    async fn latest(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Message>, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .min_by(|a, b| newest_first(a, b))
            .cloned())
    }

    async fn count_unread(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
        since: Option<Timestamp>,
    ) -> Result<u64, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.sender_id != reader
                    && !m.is_deleted
                    && since.map_or(true, |since| m.created_at > since)
            })
            .count() as u64)
    }
}

#[derive(Default)]
pub struct MemoryReadReceiptRepository {
    rows: RwLock<HashMap<(MessageId, UserId), ReadReceipt>>,
}

impl MemoryReadReceiptRepository {
    pub fn find(&self, message_id: MessageId, user_id: UserId) -> Option<ReadReceipt> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.get(&(message_id, user_id)).cloned()
    }
}

#[async_trait]
impl ReadReceiptRepository for MemoryReadReceiptRepository {
    async fn upsert(&self, receipt: ReadReceipt) -> Result<ReadReceipt, RepositoryError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let stored = rows
            .entry((receipt.message_id, receipt.user_id))
            .or_insert(receipt);
        Ok(stored.clone())
    }
}

#[derive(Default)]
pub struct MemoryNotificationRepository {
    rows: Mutex<Vec<Notification>>,
    checkpoints: Mutex<HashMap<UserId, FetchCheckpoint>>,
}

impl MemoryNotificationRepository {
    pub fn for_recipient(&self, recipient: UserId) -> Vec<Notification> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.iter()
            .filter(|n| n.recipient_id == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn insert(&self, notification: Notification) -> Result<Notification, RepositoryError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.push(notification.clone());
        Ok(notification)
    }

    async fn upsert_aggregated(
        &self,
        draft: NotificationDraft,
        window: chrono::Duration,
        now: Timestamp,
    ) -> Result<Notification, RepositoryError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = rows
            .iter_mut()
            .filter(|n| n.accepts(&draft, window, now))
            .max_by_key(|n| n.created_at);

        if let Some(notification) = existing {
            notification.absorb(draft.actor_id, now);
            return Ok(notification.clone());
        }

        let notification = Notification::from_draft(NotificationId::generate(), draft, now);
        rows.push(notification.clone());
        Ok(notification)
    }

    async fn list_created_after(
        &self,
        recipient: UserId,
        after: FetchCursor,
        until: Timestamp,
        limit: u32,
    ) -> Result<Vec<Notification>, RepositoryError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<Notification> = rows
            .iter()
            .filter(|n| n.recipient_id == recipient)
            .filter(|n| after.admits(n) && n.created_at <= until)
            .cloned()
            .collect();
        matching.sort_by_key(|n| (n.created_at, n.id));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn find_checkpoint(&self, user_id: UserId) -> Result<FetchCheckpoint, RepositoryError> {
        let checkpoints = self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(checkpoints
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| FetchCheckpoint::empty(user_id)))
    }

    async fn advance_checkpoint(
        &self,
        user_id: UserId,
        to: FetchCursor,
    ) -> Result<FetchCheckpoint, RepositoryError> {
        let mut checkpoints = self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let checkpoint = checkpoints
            .entry(user_id)
            .or_insert_with(|| FetchCheckpoint::empty(user_id));
        checkpoint.advance(to);
        Ok(checkpoint.clone())
    }
}

#[derive(Default)]
pub struct MemoryUserDirectory {
    profiles: RwLock<HashMap<UserId, UserProfile>>,
}

impl MemoryUserDirectory {
    pub fn insert(&self, profile: UserProfile) {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        profiles.insert(profile.id, profile);
    }

    /// 注册一个活跃用户并返回其 ID
    pub fn register(&self, display_name: &str) -> UserId {
        let id = UserId::generate();
        self.insert(UserProfile {
            id,
            display_name: display_name.to_string(),
            avatar_url: None,
            is_active: true,
        });
        id
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_profile(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError> {
        let profiles = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
        Ok(profiles.get(&id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryFollowGraph {
    edges: RwLock<HashSet<(UserId, UserId)>>,
}

impl MemoryFollowGraph {
    pub fn follow(&self, follower: UserId, followee: UserId) {
        let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
        edges.insert((follower, followee));
    }

    pub fn unfollow(&self, follower: UserId, followee: UserId) {
        let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
        edges.remove(&(follower, followee));
    }
}

#[async_trait]
impl FollowGraph for MemoryFollowGraph {
    async fn is_following(
        &self,
        follower: UserId,
        followee: UserId,
    ) -> Result<bool, RepositoryError> {
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        Ok(edges.contains(&(follower, followee)))
    }
}

#[derive(Default)]
pub struct MemoryContentDirectory {
    ids: RwLock<HashSet<Uuid>>,
}

impl MemoryContentDirectory {
    pub fn publish(&self, id: Uuid) {
        let mut ids = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        ids.insert(id);
    }
}

#[async_trait]
impl ContentDirectory for MemoryContentDirectory {
    async fn shared_content_exists(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let ids = self.ids.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ids.contains(&id))
    }
}

pub struct MemoryObjectStorage {
    public_base_url: String,
    objects: RwLock<HashMap<String, (String, usize)>>,
}

impl MemoryObjectStorage {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn stored(&self, name: &str) -> Option<(String, usize)> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects.get(name).cloned()
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(
        &self,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, StorageError> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.insert(name.to_string(), (content_type.to_string(), bytes.len()));
        Ok(format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            name
        ))
    }
}

/// 一整套共享状态的进程内后端
#[derive(Clone)]
pub struct MemoryBackend {
    pub conversations: Arc<MemoryConversationRepository>,
    pub memberships: Arc<MemoryMembershipRepository>,
    pub messages: Arc<MemoryMessageRepository>,
    pub receipts: Arc<MemoryReadReceiptRepository>,
    pub notifications: Arc<MemoryNotificationRepository>,
    pub users: Arc<MemoryUserDirectory>,
    pub follows: Arc<MemoryFollowGraph>,
    pub content: Arc<MemoryContentDirectory>,
    pub storage: Arc<MemoryObjectStorage>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let memberships = Arc::new(MemoryMembershipRepository::default());
        Self {
            conversations: Arc::new(MemoryConversationRepository::new(memberships.clone())),
            memberships,
            messages: Arc::new(MemoryMessageRepository::default()),
            receipts: Arc::new(MemoryReadReceiptRepository::default()),
            notifications: Arc::new(MemoryNotificationRepository::default()),
            users: Arc::new(MemoryUserDirectory::default()),
            follows: Arc::new(MemoryFollowGraph::default()),
            content: Arc::new(MemoryContentDirectory::default()),
            storage: Arc::new(MemoryObjectStorage::new("http://127.0.0.1:8080/uploads")),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}
