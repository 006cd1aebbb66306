//! 外部协作者接口
//!
//! 用户目录、关注关系、帖子类内容、对象存储和令牌校验都属于 CRUD 侧或外部服务，
//! 核心只通过这些窄接口访问它们。

use async_trait::async_trait;
use domain::{RepositoryError, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::AuthError;

/// 用户展示信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_active: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_profile(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError>;
}

/// 单向关注关系
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FollowGraph: Send + Sync {
    async fn is_following(
        &self,
        follower: UserId,
        followee: UserId,
    ) -> Result<bool, RepositoryError>;
}

/// 可被消息分享的帖子类对象
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentDirectory: Send + Sync {
    async fn shared_content_exists(&self, id: Uuid) -> Result<bool, RepositoryError>;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write object {name}: {reason}")]
    Write { name: String, reason: String },
}

/// 对象存储，写入后返回可长期访问的 URL
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(
        &self,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, StorageError>;
}

/// 校验 bearer token 的签名与有效期，解析出用户 ID
#[cfg_attr(test, mockall::automock)]
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}
