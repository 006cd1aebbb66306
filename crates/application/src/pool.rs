use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::ApplicationError;

/// 持久化调用的有界执行器
///
/// 会话任务发起的每次存储调用都要先拿到许可，并受单次超时约束，
/// 这样一个慢查询只会占住一个许可，不会拖住同进程里的其他连接。
#[derive(Debug, Clone)]
pub struct PersistencePool {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl PersistencePool {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            timeout,
        }
    }

    pub fn from_config(config: &config::ServerConfig) -> Self {
        Self::new(config.persistence_concurrency, config.persistence_timeout())
    }

    pub async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T, ApplicationError>
    where
        F: Future<Output = Result<T, ApplicationError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| {
                ApplicationError::infrastructure_with_source("persistence pool closed", err)
            })?;

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "持久化调用超时"
                );
                Err(ApplicationError::infrastructure(format!(
                    "{operation} timed out"
                )))
            }
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_as_server_errors() {
        let pool = PersistencePool::new(2, Duration::from_millis(50));
        let result: Result<(), _> = pool
            .run("slow_write", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerError);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let pool = PersistencePool::new(1, Duration::from_secs(1));
        let held = pool.clone();
        let value = held
            .run("outer", async {
                assert_eq!(pool.available(), 0);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(pool.available(), 1);
    }
}
