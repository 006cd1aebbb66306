//! 连接网关
//!
//! 校验握手里的 bearer token 并解析出用户，只有全部校验通过才创建 [`SessionMultiplexer`]。
//! 失败时不会留下任何半初始化的会话，由传输层以策略违规关闭连接。

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::collaborators::{TokenVerifier, UserDirectory};
use crate::error::{ApplicationError, AuthError};
use crate::fanout::{FanoutEvent, SessionSink};
use crate::presence::PresenceTracker;
use crate::session::{SessionMultiplexer, SessionServices};

pub const CONNECTION_ESTABLISHED_EVENT: &str = "connection.established";

pub struct GatewayDependencies {
    pub token_verifier: Arc<dyn TokenVerifier>,
    pub user_directory: Arc<dyn UserDirectory>,
    pub services: Arc<SessionServices>,
    pub clock: Arc<dyn Clock>,
    /// 每个会话出站队列的容量
    pub outbound_queue: usize,
}

pub struct ConnectionGateway {
    deps: GatewayDependencies,
}

impl ConnectionGateway {
    pub fn new(deps: GatewayDependencies) -> Self {
        Self { deps }
    }

    /// 认证并创建会话，返回会话和它的出站队列接收端
    pub async fn accept(
        &self,
        token: Option<&str>,
    ) -> Result<(SessionMultiplexer, mpsc::Receiver<FanoutEvent>), ApplicationError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::InvalidToken)?;
        let user_id = self.deps.token_verifier.verify(token)?;

        let profile = self.deps.user_directory.find_profile(user_id).await?;
        if !profile.is_some_and(|p| p.is_active) {
            return Err(AuthError::UserNotFound.into());
        }

        let (sink, receiver) = SessionSink::channel(self.deps.outbound_queue);
        let session = SessionMultiplexer::start(user_id, sink, self.deps.services.clone()).await?;

        let connected_at = match self.deps.services.presence.mark_online(user_id).await {
            Ok(at) => at,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "标记在线失败");
                self.deps.clock.now()
            }
        };

        session.deliver_direct(&FanoutEvent::durable(
            CONNECTION_ESTABLISHED_EVENT,
            json!({
                "user_id": user_id,
                "session_id": session.session_id().to_string(),
                "connected_at": connected_at,
            }),
        ));

        tracing::info!(
            user_id = %user_id,
            session_id = %session.session_id(),
            "连接已建立"
        );
        Ok((session, receiver))
    }
}
