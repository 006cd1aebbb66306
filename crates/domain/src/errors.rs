//! 领域模型错误定义
//!
//! 业务规则违反统一用 [`DomainError`] 表达，存储层失败用 [`RepositoryError`] 表达。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("conversation not found")]
    ConversationNotFound,

    #[error("conversation is no longer active")]
    ConversationInactive,

    #[error("message not found")]
    MessageNotFound,

    #[error("shared post not found")]
    PostNotFound,

    #[error("user is not an active member of the conversation")]
    NotMember,

    /// 非消息发送者尝试编辑或删除
    #[error("only the sender may modify this message")]
    NotMessageOwner,

    #[error("operation not allowed")]
    OperationNotAllowed,

    /// 私聊要求发送者关注接收者
    #[error("sender does not follow the receiver")]
    NoFollowRelationship,

    #[error("message requires text, an attachment or shared content")]
    EmptyMessage,

    #[error("message has already been deleted")]
    MessageAlreadyDeleted,

    #[error("edit window has expired")]
    EditWindowExpired,

    #[error("delete window has expired")]
    DeleteWindowExpired,

    #[error("file exceeds the size limit of {limit} bytes")]
    FileTooLarge { limit: u64 },

    #[error("file type {content_type} is not allowed")]
    InvalidFileType { content_type: String },
}

impl DomainError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 仓储错误
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,

    /// 唯一约束冲突
    #[error("record already exists")]
    Conflict,

    #[error("storage failure: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
pub type RepositoryResult<T> = Result<T, RepositoryError>;
