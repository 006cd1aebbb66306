#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    memory::MemoryBackend, Clock, LocalFanoutBus, MemoryPresenceTracker, MemoryRateLimiter,
    SystemClock,
};
use config::AppConfig;
use domain::UserId;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppDependencies, AppState, JwtService};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub const TEST_SECRET: &str = "integration-test-secret-0123456789";

pub struct TestServer {
    pub addr: SocketAddr,
    pub backend: MemoryBackend,
    pub jwt: JwtService,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn token(&self, user_id: UserId) -> String {
        self.jwt.generate_token(user_id).expect("token")
    }

    pub async fn connect(&self, token: Option<&str>) -> WsStream {
        let url = match token {
            Some(token) => format!("ws://{}/ws?token={}", self.addr, token),
            None => format!("ws://{}/ws", self.addr),
        };
        let (stream, _) = connect_async(url).await.expect("websocket connect");
        stream
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.jwt.secret = TEST_SECRET.to_string();
    config
}

/// 用内存后端和单进程协调服务启动一个真实监听端口的服务
pub async fn spawn_server() -> TestServer {
    let config = test_config();
    let backend = MemoryBackend::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let deps = AppDependencies {
        conversation_repository: backend.conversations.clone(),
        membership_repository: backend.memberships.clone(),
        message_repository: backend.messages.clone(),
        receipt_repository: backend.receipts.clone(),
        notification_repository: backend.notifications.clone(),
        user_directory: backend.users.clone(),
        follow_graph: backend.follows.clone(),
        content_directory: backend.content.clone(),
        object_storage: backend.storage.clone(),
        fanout: Arc::new(LocalFanoutBus::new()),
        rate_limiter: Arc::new(MemoryRateLimiter::new(clock.clone())),
        presence: Arc::new(MemoryPresenceTracker::new(clock.clone())),
        clock,
    };
    let app = router(AppState::build(deps, &config));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    TestServer {
        addr,
        backend,
        jwt: JwtService::new(&config.jwt),
        _shutdown: shutdown_tx,
    }
}

/// 读取下一个文本帧，跳过心跳
pub async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame before timeout")
            .expect("stream still open")
            .expect("valid frame");
        match message {
            TungsteniteMessage::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("json frame")
            }
            TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// 读到指定类型的帧为止，途中的其它帧丢弃
pub async fn next_of_type(ws: &mut WsStream, frame_type: &str) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == frame_type {
            return frame;
        }
    }
}
