//! 消息实体与生命周期状态机
//!
//! `Created → {Edited}* → Deleted`，删除为终态。编辑和删除各自受创建时间起算的时间窗口约束。

use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, MessageId, MessageText, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    File,
}

impl AttachmentKind {
    /// 根据 MIME 类型推断附件种类
    pub fn from_content_type(content_type: &str) -> Self {
        let major = content_type.split('/').next().unwrap_or_default();
        match major {
            "image" => AttachmentKind::Image,
            "video" => AttachmentKind::Video,
            "audio" => AttachmentKind::Audio,
            _ => AttachmentKind::File,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::Audio => "audio",
            AttachmentKind::File => "file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// 已上传到对象存储的附件描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub url: String,
    pub kind: AttachmentKind,
    pub size: u64,
    pub name: String,
}

impl AttachmentDescriptor {
    /// 只接受带主机名的 http(s) 地址
    pub fn validate(&self) -> Result<(), DomainError> {
        let rest = self
            .url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"))
            .ok_or_else(|| DomainError::invalid_argument("attachment.url", "must be http(s)"))?;
        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() || rest.chars().any(char::is_whitespace) {
            return Err(DomainError::invalid_argument(
                "attachment.url",
                "malformed url",
            ));
        }
        if self.name.trim().is_empty() {
            return Err(DomainError::invalid_argument(
                "attachment.name",
                "cannot be empty",
            ));
        }
        Ok(())
    }
}

/// 编辑 / 删除时间窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageWindows {
    pub edit: Duration,
    pub delete: Duration,
}

impl Default for MessageWindows {
    fn default() -> Self {
        Self {
            edit: Duration::hours(24),
            delete: Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Created,
    Edited,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: MessageText,
    pub attachment: Option<AttachmentDescriptor>,
    pub reply_to: Option<MessageId>,
    /// 外部帖子类对象的引用
    pub shared_content_id: Option<Uuid>,
    pub created_at: Timestamp,
    pub edited_at: Option<Timestamp>,
    pub is_deleted: bool,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: MessageText,
        attachment: Option<AttachmentDescriptor>,
        reply_to: Option<MessageId>,
        shared_content_id: Option<Uuid>,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        if text.is_blank() && attachment.is_none() && shared_content_id.is_none() {
            return Err(DomainError::EmptyMessage);
        }
        if let Some(attachment) = &attachment {
            attachment.validate()?;
        }
        Ok(Self {
            id,
            conversation_id,
            sender_id,
            text,
            attachment,
            reply_to,
            shared_content_id,
            created_at,
            edited_at: None,
            is_deleted: false,
        })
    }

    pub fn state(&self) -> MessageState {
        if self.is_deleted {
            MessageState::Deleted
        } else if self.edited_at.is_some() {
            MessageState::Edited
        } else {
            MessageState::Created
        }
    }

    pub fn edit(
        &mut self,
        editor: UserId,
        text: MessageText,
        now: Timestamp,
        windows: &MessageWindows,
    ) -> Result<(), DomainError> {
        self.ensure_owner(editor)?;
        if self.is_deleted {
            return Err(DomainError::MessageAlreadyDeleted);
        }
        if self.age(now) > windows.edit {
            return Err(DomainError::EditWindowExpired);
        }
        if text.is_blank() {
            return Err(DomainError::invalid_argument("text", "cannot be empty"));
        }
        self.text = text;
        self.edited_at = Some(now);
        Ok(())
    }

    /// 软删除：清空正文但保留行，供回复引用和墓碑广播使用。重复删除是错误。
    pub fn delete(
        &mut self,
        actor: UserId,
        now: Timestamp,
        windows: &MessageWindows,
    ) -> Result<(), DomainError> {
        self.ensure_owner(actor)?;
        if self.is_deleted {
            return Err(DomainError::MessageAlreadyDeleted);
        }
        if self.age(now) > windows.delete {
            return Err(DomainError::DeleteWindowExpired);
        }
        self.text = MessageText::empty();
        self.is_deleted = true;
        Ok(())
    }

    fn ensure_owner(&self, user_id: UserId) -> Result<(), DomainError> {
        if self.sender_id != user_id {
            return Err(DomainError::NotMessageOwner);
        }
        Ok(())
    }

    fn age(&self, now: Timestamp) -> Duration {
        now.signed_duration_since(self.created_at)
    }
}

/// 单条消息的已读回执，(message, user) 唯一
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub read_at: Timestamp,
}
