use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "DIRECT",
            ConversationKind::Group => "GROUP",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DIRECT" => Some(Self::Direct),
            "GROUP" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// 仅群聊有名称和描述
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_by: UserId,
    pub is_active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Conversation {
    pub fn new_direct(id: ConversationId, created_by: UserId, now: Timestamp) -> Self {
        Self {
            id,
            kind: ConversationKind::Direct,
            name: None,
            description: None,
            created_by,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_group(
        id: ConversationId,
        name: impl Into<String>,
        description: Option<String>,
        created_by: UserId,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        let name = Self::validate_name(name.into())?;
        Ok(Self {
            id,
            kind: ConversationKind::Group,
            name: Some(name),
            description: description.map(|d| d.trim().to_owned()).filter(|d| !d.is_empty()),
            created_by,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ConversationKind::Direct
    }

    pub fn deactivate(&mut self, now: Timestamp) {
        self.is_active = false;
        self.updated_at = now;
    }

    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = now;
    }

    fn validate_name(name: String) -> Result<String, DomainError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_argument("name", "cannot be empty"));
        }
        if trimmed.chars().count() > 100 {
            return Err(DomainError::invalid_argument("name", "too long"));
        }
        Ok(trimmed.to_owned())
    }
}

/// 会话成员关系，(conversation, user) 唯一。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_admin: bool,
    pub joined_at: Timestamp,
    pub left_at: Option<Timestamp>,
    pub last_read_at: Option<Timestamp>,
}

impl Membership {
    pub fn new(
        conversation_id: ConversationId,
        user_id: UserId,
        is_admin: bool,
        joined_at: Timestamp,
    ) -> Self {
        Self {
            conversation_id,
            user_id,
            is_admin,
            joined_at,
            left_at: None,
            last_read_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }

    pub fn leave(&mut self, now: Timestamp) {
        if self.left_at.is_none() {
            self.left_at = Some(now);
        }
    }

    pub fn rejoin(&mut self, now: Timestamp) {
        self.left_at = None;
        self.joined_at = now;
    }

    /// last_read_at 只前进不后退
    pub fn mark_read(&mut self, at: Timestamp) {
        match self.last_read_at {
            Some(current) if current >= at => {}
            _ => self.last_read_at = Some(at),
        }
    }
}
