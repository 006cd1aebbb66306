//! 只读的外部目录：用户资料、关注关系、可分享内容

use application::{ContentDirectory, FollowGraph, UserDirectory, UserProfile};
use async_trait::async_trait;
use domain::{RepositoryError, UserId};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::map_sqlx_err;

#[derive(Debug, FromRow)]
struct UserRecord {
    id: Uuid,
    display_name: String,
    avatar_url: Option<String>,
    is_active: bool,
}

impl From<UserRecord> for UserProfile {
    fn from(value: UserRecord) -> Self {
        UserProfile {
            id: UserId::from(value.id),
            display_name: value.display_name,
            avatar_url: value.avatar_url,
            is_active: value.is_active,
        }
    }
}

#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_profile(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT id, display_name, avatar_url, is_active FROM users WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(UserProfile::from))
    }
}

#[derive(Clone)]
pub struct PgFollowGraph {
    pool: PgPool,
}

impl PgFollowGraph {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FollowGraph for PgFollowGraph {
    async fn is_following(
        &self,
        follower: UserId,
        followee: UserId,
    ) -> Result<bool, RepositoryError> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM follows WHERE follower_id = $1 AND followee_id = $2)",
        )
        .bind(Uuid::from(follower))
        .bind(Uuid::from(followee))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }
}

#[derive(Clone)]
pub struct PgContentDirectory {
    pool: PgPool,
}

impl PgContentDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentDirectory for PgContentDirectory {
    async fn shared_content_exists(&self, id: Uuid) -> Result<bool, RepositoryError> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }
}
