use domain::{DomainError, RepositoryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collaborators::StorageError;
use crate::fanout::FanoutError;
use crate::protocol::ProtocolError;

/// 客户端依赖的稳定错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidToken,
    TokenExpired,
    UserNotFound,
    ConversationNotFound,
    NotMember,
    MessageNotFound,
    Unauthorized,
    ValidationError,
    RateLimitExceeded,
    EditTimeExpired,
    DeleteTimeExpired,
    InvalidAction,
    ServerError,
    NoFollowRelationship,
    PostNotFound,
    FileTooLarge,
    InvalidFileType,
    FileUploadFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::UserNotFound => "USER_NOT_FOUND",
            ErrorCode::ConversationNotFound => "CONVERSATION_NOT_FOUND",
            ErrorCode::NotMember => "NOT_MEMBER",
            ErrorCode::MessageNotFound => "MESSAGE_NOT_FOUND",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::EditTimeExpired => "EDIT_TIME_EXPIRED",
            ErrorCode::DeleteTimeExpired => "DELETE_TIME_EXPIRED",
            ErrorCode::InvalidAction => "INVALID_ACTION",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::NoFollowRelationship => "NO_FOLLOW_RELATIONSHIP",
            ErrorCode::PostNotFound => "POST_NOT_FOUND",
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::InvalidFileType => "INVALID_FILE_TYPE",
            ErrorCode::FileUploadFailed => "FILE_UPLOAD_FAILED",
        }
    }
}

/// 错误分类：决定传播方式与日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 连接级错误，关闭连接
    Auth,
    NotFound,
    Authorization,
    Validation,
    TimeWindowExpired,
    RateLimit,
    Server,
}

impl ErrorKind {
    /// 预期内的用户侧错误不需要按服务器错误记录
    pub fn is_expected(&self) -> bool {
        !matches!(self, ErrorKind::Server)
    }
}

/// 握手阶段的认证错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing or malformed token")]
    InvalidToken,
    #[error("token has expired")]
    TokenExpired,
    #[error("user not found or inactive")]
    UserNotFound,
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::InvalidToken => ErrorCode::InvalidToken,
            AuthError::TokenExpired => ErrorCode::TokenExpired,
            AuthError::UserNotFound => ErrorCode::UserNotFound,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("rate limit exceeded for {action}")]
    RateLimited { action: String },
    #[error("fanout error: {0}")]
    Fanout(#[from] FanoutError),
    #[error("object storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("infrastructure error: {message}")]
    Infrastructure {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: None,
        }
    }

    pub fn infrastructure_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApplicationError::Domain(err) => match err {
                DomainError::InvalidArgument { .. }
                | DomainError::EmptyMessage
                | DomainError::MessageAlreadyDeleted
                | DomainError::ConversationInactive => ErrorCode::ValidationError,
                DomainError::ConversationNotFound => ErrorCode::ConversationNotFound,
                DomainError::MessageNotFound => ErrorCode::MessageNotFound,
                DomainError::PostNotFound => ErrorCode::PostNotFound,
                DomainError::NotMember => ErrorCode::NotMember,
                DomainError::NotMessageOwner | DomainError::OperationNotAllowed => {
                    ErrorCode::Unauthorized
                }
                DomainError::NoFollowRelationship => ErrorCode::NoFollowRelationship,
                DomainError::EditWindowExpired => ErrorCode::EditTimeExpired,
                DomainError::DeleteWindowExpired => ErrorCode::DeleteTimeExpired,
                DomainError::FileTooLarge { .. } => ErrorCode::FileTooLarge,
                DomainError::InvalidFileType { .. } => ErrorCode::InvalidFileType,
            },
            ApplicationError::Authentication(err) => err.code(),
            ApplicationError::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            ApplicationError::Storage(_) => ErrorCode::FileUploadFailed,
            ApplicationError::Protocol(ProtocolError::UnknownAction(_)) => ErrorCode::InvalidAction,
            ApplicationError::Protocol(_) => ErrorCode::ValidationError,
            ApplicationError::Repository(_)
            | ApplicationError::Fanout(_)
            | ApplicationError::Infrastructure { .. } => ErrorCode::ServerError,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code() {
            ErrorCode::InvalidToken | ErrorCode::TokenExpired | ErrorCode::UserNotFound => {
                ErrorKind::Auth
            }
            ErrorCode::ConversationNotFound
            | ErrorCode::MessageNotFound
            | ErrorCode::PostNotFound => ErrorKind::NotFound,
            ErrorCode::NotMember | ErrorCode::Unauthorized | ErrorCode::NoFollowRelationship => {
                ErrorKind::Authorization
            }
            ErrorCode::ValidationError
            | ErrorCode::InvalidAction
            | ErrorCode::FileTooLarge
            | ErrorCode::InvalidFileType => ErrorKind::Validation,
            ErrorCode::EditTimeExpired | ErrorCode::DeleteTimeExpired => {
                ErrorKind::TimeWindowExpired
            }
            ErrorCode::RateLimitExceeded => ErrorKind::RateLimit,
            ErrorCode::ServerError | ErrorCode::FileUploadFailed => ErrorKind::Server,
        }
    }

    /// 返回给客户端的文字说明，服务器错误不泄露内部细节
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Server => match self {
                ApplicationError::Storage(_) => "file upload failed".to_string(),
                _ => "internal server error".to_string(),
            },
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_window_errors_map_to_stable_codes() {
        let edit = ApplicationError::from(DomainError::EditWindowExpired);
        assert_eq!(edit.code(), ErrorCode::EditTimeExpired);
        assert_eq!(edit.kind(), ErrorKind::TimeWindowExpired);
        assert!(edit.kind().is_expected());

        let delete = ApplicationError::from(DomainError::DeleteWindowExpired);
        assert_eq!(delete.code().as_str(), "DELETE_TIME_EXPIRED");
    }

    #[test]
    fn storage_failures_are_server_errors() {
        let err = ApplicationError::from(RepositoryError::storage("connection reset"));
        assert_eq!(err.code(), ErrorCode::ServerError);
        assert!(!err.kind().is_expected());
        assert_eq!(err.public_message(), "internal server error");
    }

    #[test]
    fn unknown_action_is_invalid_action() {
        let err = ApplicationError::from(ProtocolError::UnknownAction("shout".into()));
        assert_eq!(err.code(), ErrorCode::InvalidAction);
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn error_code_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::NoFollowRelationship).unwrap();
        assert_eq!(json, "\"NO_FOLLOW_RELATIONSHIP\"");
    }
}
