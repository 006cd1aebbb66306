//! 主应用程序入口
//!
//! 读取配置、连接 Postgres/Redis、组装服务并启动 Axum。

use std::sync::Arc;

use anyhow::Context;
use application::{Clock, SystemClock};
use config::AppConfig;
use infrastructure::Infrastructure;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppDependencies, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    config.validate().context("配置校验失败")?;

    let shutdown = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let infra = Infrastructure::connect(&config, clock.clone(), shutdown.clone())
        .await
        .context("初始化基础设施失败")?;
    let storage = infra.storage.clone();

    let state = AppState::build(
        AppDependencies {
            conversation_repository: storage.conversations.clone(),
            membership_repository: storage.memberships.clone(),
            message_repository: storage.messages.clone(),
            receipt_repository: storage.receipts.clone(),
            notification_repository: storage.notifications.clone(),
            user_directory: storage.users.clone(),
            follow_graph: storage.follows.clone(),
            content_directory: storage.content.clone(),
            object_storage: infra.object_storage.clone(),
            fanout: infra.fanout.clone(),
            rate_limiter: infra.rate_limiter.clone(),
            presence: infra.presence.clone(),
            clock,
        },
        &config,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听 {addr} 失败"))?;
    tracing::info!(addr = %addr, "服务器已启动");

    let app = router(state).nest_service("/uploads", ServeDir::new(&config.storage.root));
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("服务器已停止");
    Ok(())
}

/// 收到 Ctrl+C 后通知后台任务（Redis 订阅循环等）一起退出
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "监听退出信号失败");
    }
    tracing::info!("收到退出信号，开始优雅关闭");
    shutdown.cancel();
}
