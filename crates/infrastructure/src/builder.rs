use std::sync::Arc;

use application::{
    Clock, FanoutBus, LocalFanoutBus, MemoryPresenceTracker, MemoryRateLimiter, PresenceTracker,
    RateLimiter, RedisPresenceTracker, RedisRateLimiter,
};
use config::AppConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    fanout::RedisFanoutBus,
    migrations::MIGRATOR,
    repository::{create_pg_pool, PgStorage},
    storage::LocalDiskStorage,
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 启动时组装好的全部外部适配器
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
    pub fanout: Arc<dyn FanoutBus>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub presence: Arc<dyn PresenceTracker>,
    pub object_storage: Arc<LocalDiskStorage>,
}

impl Infrastructure {
    /// 连接数据库并执行迁移。配置了 Redis 时广播、限流和在线状态走 Redis，
    /// 否则退回单进程实现。
    pub async fn connect(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        let storage = Arc::new(PgStorage::new(pool));
        let object_storage = Arc::new(LocalDiskStorage::from_config(&config.storage));

        let (fanout, rate_limiter, presence): (
            Arc<dyn FanoutBus>,
            Arc<dyn RateLimiter>,
            Arc<dyn PresenceTracker>,
        ) = match &config.redis.url {
            Some(url) => {
                let prefix = config.redis.key_prefix.clone();
                let client = redis::Client::open(url.as_str())?;
                let connection = client.get_connection_manager().await?;
                let fanout = RedisFanoutBus::connect(client, prefix.clone(), shutdown).await?;
                tracing::info!(key_prefix = %prefix, "使用 Redis 广播、限流与在线状态");
                (
                    Arc::new(fanout),
                    Arc::new(RedisRateLimiter::new(
                        connection.clone(),
                        prefix.clone(),
                        clock.clone(),
                    )),
                    Arc::new(RedisPresenceTracker::new(connection, prefix, clock)),
                )
            }
            None => {
                tracing::warn!("未配置 Redis，广播与限流仅在当前进程内生效");
                (
                    Arc::new(LocalFanoutBus::new()),
                    Arc::new(MemoryRateLimiter::new(clock.clone())),
                    Arc::new(MemoryPresenceTracker::new(clock)),
                )
            }
        };

        Ok(Self {
            storage,
            fanout,
            rate_limiter,
            presence,
            object_storage,
        })
    }
}
