//! WebSocket 连接
//!
//! 握手阶段在超时内完成认证，失败以策略违规（1008）关闭，不处理任何业务帧。
//! 认证通过后一个循环同时处理：客户端帧、出站队列、驱逐信号和心跳。

use std::time::Duration;

use application::{FanoutEvent, SessionMultiplexer};
use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const LAGGING_REASON: &str = "lagging";

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

pub async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handshake(socket, state, query.token))
}

async fn handshake(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let accepted =
        tokio::time::timeout(state.handshake_timeout, state.gateway.accept(token.as_deref()))
            .await;

    let (session, outbound) = match accepted {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "WebSocket 握手认证失败");
            close(&mut socket, close_code::POLICY, err.code().as_str()).await;
            return;
        }
        Err(_) => {
            tracing::warn!("WebSocket 握手超时");
            close(&mut socket, close_code::POLICY, "HANDSHAKE_TIMEOUT").await;
            return;
        }
    };

    WebSocketConnection::new(socket, session, outbound).run().await;
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(err) = socket.send(WsMessage::Close(Some(frame))).await {
        tracing::debug!(error = %err, "发送关闭帧失败");
    }
}

/// 一个已认证的 WebSocket 连接
pub struct WebSocketConnection {
    socket: WebSocket,
    session: SessionMultiplexer,
    outbound: mpsc::Receiver<FanoutEvent>,
}

impl WebSocketConnection {
    pub fn new(
        socket: WebSocket,
        session: SessionMultiplexer,
        outbound: mpsc::Receiver<FanoutEvent>,
    ) -> Self {
        Self {
            socket,
            session,
            outbound,
        }
    }

    pub async fn run(self) {
        let Self {
            socket,
            mut session,
            mut outbound,
        } = self;
        let (mut sender, mut incoming) = socket.split();
        let eviction = session.eviction();
        let user_id = session.user_id();

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                inbound = incoming.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        let ack = session.handle(text.as_str()).await;
                        match serde_json::to_string(&ack) {
                            Ok(frame) => {
                                if !send_text(&mut sender, frame).await {
                                    break;
                                }
                            }
                            Err(err) => tracing::error!(error = %err, "回执序列化失败"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::debug!(user_id = %user_id, "客户端关闭连接");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(user_id = %user_id, error = %err, "WebSocket 读取失败");
                        break;
                    }
                },
                Some(event) = outbound.recv() => {
                    session.observe(&event).await;
                    match event.to_frame() {
                        Ok(frame) => {
                            if !send_text(&mut sender, frame).await {
                                break;
                            }
                        }
                        Err(err) => tracing::error!(event_type = %event.event_type, error = %err, "广播帧编码失败"),
                    }
                }
                _ = eviction.cancelled() => {
                    tracing::warn!(user_id = %user_id, "出站队列溢出，断开慢连接");
                    let frame = CloseFrame {
                        code: close_code::AGAIN,
                        reason: LAGGING_REASON.to_string().into(),
                    };
                    let _ = sender.send(WsMessage::Close(Some(frame))).await;
                    break;
                }
                _ = heartbeat.tick() => {
                    if sender.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        session.close().await;
        tracing::info!(user_id = %user_id, session_id = %session.session_id(), "WebSocket 连接已断开");
    }
}

async fn send_text(sender: &mut SplitSink<WebSocket, WsMessage>, frame: String) -> bool {
    sender.send(WsMessage::Text(frame.into())).await.is_ok()
}
