//! 基础设施层实现。
//!
//! 提供 PostgreSQL 仓储、Redis 跨进程广播、本地磁盘对象存储等适配器，实现应用层定义的接口。

pub mod builder;
pub mod fanout;
pub mod migrations;
pub mod repository;
pub mod storage;

pub use builder::{Infrastructure, InfrastructureError};
pub use fanout::RedisFanoutBus;
pub use migrations::MIGRATOR;
pub use repository::{
    create_pg_pool, PgContentDirectory, PgConversationRepository, PgFollowGraph,
    PgMembershipRepository, PgMessageRepository, PgNotificationRepository,
    PgReadReceiptRepository, PgStorage, PgUserDirectory,
};
pub use storage::LocalDiskStorage;
