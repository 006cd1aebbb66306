//! WebSocket 帧协议
//!
//! 入站：`{"action": ..., "request_id": ..., ...字段}`；
//! 回执：`{"type": "ack", "action", "request_id", "ok", "data"?, "error"?, "error_code"?}`；
//! 广播：`{"type": "<domain>.<event>", "data": {...}}`，见 [`crate::fanout::FanoutEvent`]。

use domain::{AttachmentDescriptor, ConversationId, MessageId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use crate::error::ErrorCode;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("invalid payload for {action}: {reason}")]
    InvalidPayload { action: String, reason: String },
}

/// 无法解析的入站帧，尽量带回 request_id 以便客户端关联错误回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFrame {
    pub error: ProtocolError,
    pub request_id: Option<String>,
}

impl RejectedFrame {
    fn new(reason: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            error: ProtocolError::MalformedFrame(reason.into()),
            request_id,
        }
    }
}

/// 已经拆出信封字段的入站帧
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub action: String,
    pub request_id: Option<String>,
    pub body: Value,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, RejectedFrame> {
        let body: Value =
            serde_json::from_str(raw).map_err(|err| RejectedFrame::new(err.to_string(), None))?;

        let Value::Object(fields) = &body else {
            return Err(RejectedFrame::new("frame must be a JSON object", None));
        };

        let request_id = match fields.get("request_id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };

        let action = match fields.get("action") {
            Some(Value::String(action)) if !action.is_empty() => action.clone(),
            _ => return Err(RejectedFrame::new("missing action", request_id)),
        };

        Ok(Self {
            action,
            request_id,
            body,
        })
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.body.clone()).map_err(|err| ProtocolError::InvalidPayload {
            action: self.action.clone(),
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendMessagePayload {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachment: Option<AttachmentDescriptor>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub shared_content_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EditMessagePayload {
    pub message_id: MessageId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageRefPayload {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarkReadPayload {
    pub conversation_id: ConversationId,
    /// 为空表示整个会话已读
    #[serde(default)]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConversationRefPayload {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    #[serde(default = "default_typing")]
    pub is_typing: bool,
}

fn default_typing() -> bool {
    true
}

/// 客户端动作
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    SendMessage(SendMessagePayload),
    EditMessage(EditMessagePayload),
    DeleteMessage(MessageRefPayload),
    MarkRead(MarkReadPayload),
    JoinConversation(ConversationRefPayload),
    LeaveConversation(ConversationRefPayload),
    Typing(TypingPayload),
    GetPresence(ConversationRefPayload),
}

impl ClientAction {
    pub fn decode(frame: &InboundFrame) -> Result<Self, ProtocolError> {
        let action = match frame.action.as_str() {
            "send_message" => ClientAction::SendMessage(frame.payload()?),
            "edit_message" => ClientAction::EditMessage(frame.payload()?),
            "delete_message" => ClientAction::DeleteMessage(frame.payload()?),
            "mark_read" => ClientAction::MarkRead(frame.payload()?),
            "join_conversation" => ClientAction::JoinConversation(frame.payload()?),
            "leave_conversation" => ClientAction::LeaveConversation(frame.payload()?),
            "typing" => ClientAction::Typing(frame.payload()?),
            "get_presence" => ClientAction::GetPresence(frame.payload()?),
            other => return Err(ProtocolError::UnknownAction(other.to_string())),
        };
        Ok(action)
    }
}

/// 对某个请求的回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub action: String,
    pub request_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl Ack {
    pub fn success(
        action: impl Into<String>,
        request_id: Option<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            frame_type: "ack".to_string(),
            action: action.into(),
            request_id,
            ok: true,
            data,
            error: None,
            error_code: None,
        }
    }

    pub fn failure(
        action: impl Into<String>,
        request_id: Option<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            frame_type: "ack".to_string(),
            action: action.into(),
            request_id,
            ok: false,
            data: None,
            error: Some(message.into()),
            error_code: Some(code),
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
