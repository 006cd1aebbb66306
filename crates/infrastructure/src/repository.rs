//! PostgreSQL 仓储实现

mod conversation;
mod directory;
mod message;
mod notification;

use std::sync::Arc;

use domain::RepositoryError;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub use conversation::{PgConversationRepository, PgMembershipRepository};
pub use directory::{PgContentDirectory, PgFollowGraph, PgUserDirectory};
pub use message::{PgMessageRepository, PgReadReceiptRepository};
pub use notification::PgNotificationRepository;

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
        _ => RepositoryError::storage_with_source("database query failed", err),
    }
}

pub(crate) fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// 共享同一个连接池的全部仓储
#[derive(Clone)]
pub struct PgStorage {
    pub conversations: Arc<PgConversationRepository>,
    pub memberships: Arc<PgMembershipRepository>,
    pub messages: Arc<PgMessageRepository>,
    pub receipts: Arc<PgReadReceiptRepository>,
    pub notifications: Arc<PgNotificationRepository>,
    pub users: Arc<PgUserDirectory>,
    pub follows: Arc<PgFollowGraph>,
    pub content: Arc<PgContentDirectory>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            conversations: Arc::new(PgConversationRepository::new(pool.clone())),
            memberships: Arc::new(PgMembershipRepository::new(pool.clone())),
            messages: Arc::new(PgMessageRepository::new(pool.clone())),
            receipts: Arc::new(PgReadReceiptRepository::new(pool.clone())),
            notifications: Arc::new(PgNotificationRepository::new(pool.clone())),
            users: Arc::new(PgUserDirectory::new(pool.clone())),
            follows: Arc::new(PgFollowGraph::new(pool.clone())),
            content: Arc::new(PgContentDirectory::new(pool)),
        }
    }
}
