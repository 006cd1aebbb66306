use domain::{
    AttachmentKind, Conversation, ConversationId, FetchCursor, Message, Notification, Timestamp,
    UserId,
};
use serde::{Deserialize, Serialize};

/// 收件箱中的一个会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub conversation: Conversation,
    pub last_message: Option<Message>,
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberView {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_admin: bool,
    pub online: bool,
    pub last_seen: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub members: Vec<MemberView>,
    /// 最新的在前
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceView {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPresence {
    pub conversation_id: ConversationId,
    pub members: Vec<PresenceView>,
}

/// 上传结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub file_url: String,
    pub file_type: AttachmentKind,
    pub file_size: u64,
    pub file_name: String,
}

/// 一次补发拉取的结果；cursor 是确认后检查点要前进到的位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissedNotifications {
    pub notifications: Vec<Notification>,
    pub cursor: FetchCursor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}
