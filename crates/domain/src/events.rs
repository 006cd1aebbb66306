//! 领域事件
//!
//! [`MessageEvent`] 由消息生命周期的每次成功状态转换产生；[`SocialEvent`] 由 CRUD 写路径显式派发给通知聚合器。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;
use crate::notification::{NotificationDraft, NotificationTarget, NotificationType, TargetKind};
use crate::value_objects::{ConversationId, MessageId, MessageText, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageEvent {
    Created {
        message: Message,
    },
    Edited {
        message_id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: MessageText,
        edited_at: Timestamp,
    },
    /// 墓碑事件，正文已清空
    Deleted {
        message_id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        deleted_at: Timestamp,
    },
    /// message_id 为空表示会话级全部已读
    Read {
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: Option<MessageId>,
        read_at: Timestamp,
    },
}

impl MessageEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            MessageEvent::Created { message } => message.conversation_id,
            MessageEvent::Edited {
                conversation_id, ..
            }
            | MessageEvent::Deleted {
                conversation_id, ..
            }
            | MessageEvent::Read {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    /// 对外广播的事件类型名
    pub fn event_type(&self) -> &'static str {
        match self {
            MessageEvent::Created { .. } => "message.new",
            MessageEvent::Edited { .. } => "message.edited",
            MessageEvent::Deleted { .. } => "message.deleted",
            MessageEvent::Read { .. } => "message.read",
        }
    }

    /// 已读回执只是提示，可以在背压下丢弃
    pub fn is_best_effort(&self) -> bool {
        matches!(self, MessageEvent::Read { .. })
    }
}

/// CRUD 层记录下来的社交行为
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocialEvent {
    Followed {
        follower_id: UserId,
        followee_id: UserId,
    },
    PostLiked {
        actor_id: UserId,
        post_id: Uuid,
        author_id: UserId,
    },
    CommentLiked {
        actor_id: UserId,
        comment_id: Uuid,
        author_id: UserId,
    },
    PrayerRequestLiked {
        actor_id: UserId,
        prayer_request_id: Uuid,
        author_id: UserId,
    },
    CommentedOnPost {
        actor_id: UserId,
        post_id: Uuid,
        author_id: UserId,
    },
    CommentedOnPrayerRequest {
        actor_id: UserId,
        prayer_request_id: Uuid,
        author_id: UserId,
    },
    MessageReceived {
        sender_id: UserId,
        recipient_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}

impl SocialEvent {
    pub fn into_draft(self) -> NotificationDraft {
        fn draft(
            recipient_id: UserId,
            notification_type: NotificationType,
            actor_id: UserId,
            id: Uuid,
            kind: TargetKind,
        ) -> NotificationDraft {
            NotificationDraft {
                recipient_id,
                notification_type,
                actor_id,
                target: NotificationTarget { id, kind },
                conversation_id: None,
                message_id: None,
            }
        }

        match self {
            SocialEvent::Followed {
                follower_id,
                followee_id,
            } => draft(
                followee_id,
                NotificationType::Follow,
                follower_id,
                follower_id.0,
                TargetKind::User,
            ),
            SocialEvent::PostLiked {
                actor_id,
                post_id,
                author_id,
            } => draft(
                author_id,
                NotificationType::PostLike,
                actor_id,
                post_id,
                TargetKind::Post,
            ),
            SocialEvent::CommentLiked {
                actor_id,
                comment_id,
                author_id,
            } => draft(
                author_id,
                NotificationType::CommentLike,
                actor_id,
                comment_id,
                TargetKind::Comment,
            ),
            SocialEvent::PrayerRequestLiked {
                actor_id,
                prayer_request_id,
                author_id,
            } => draft(
                author_id,
                NotificationType::PrayerRequestLike,
                actor_id,
                prayer_request_id,
                TargetKind::PrayerRequest,
            ),
            SocialEvent::CommentedOnPost {
                actor_id,
                post_id,
                author_id,
            } => draft(
                author_id,
                NotificationType::CommentOnPost,
                actor_id,
                post_id,
                TargetKind::Post,
            ),
            SocialEvent::CommentedOnPrayerRequest {
                actor_id,
                prayer_request_id,
                author_id,
            } => draft(
                author_id,
                NotificationType::CommentOnPrayerRequest,
                actor_id,
                prayer_request_id,
                TargetKind::PrayerRequest,
            ),
            SocialEvent::MessageReceived {
                sender_id,
                recipient_id,
                conversation_id,
                message_id,
            } => NotificationDraft {
                conversation_id: Some(conversation_id),
                message_id: Some(message_id),
                ..draft(
                    recipient_id,
                    NotificationType::NewMessage,
                    sender_id,
                    message_id.0,
                    TargetKind::Message,
                )
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_targets_the_follower() {
        let follower = UserId::generate();
        let followee = UserId::generate();
        let draft = SocialEvent::Followed {
            follower_id: follower,
            followee_id: followee,
        }
        .into_draft();

        assert_eq!(draft.recipient_id, followee);
        assert_eq!(draft.actor_id, follower);
        assert_eq!(draft.target.kind, TargetKind::User);
        assert!(!draft.notification_type.is_aggregatable());
    }

    #[test]
    fn comment_on_post_aggregates_on_the_post() {
        let post = Uuid::new_v4();
        let draft = SocialEvent::CommentedOnPost {
            actor_id: UserId::generate(),
            post_id: post,
            author_id: UserId::generate(),
        }
        .into_draft();
        assert_eq!(draft.target.id, post);
        assert!(draft.notification_type.is_aggregatable());
    }

    #[test]
    fn social_event_wire_shape() {
        let json = serde_json::json!({
            "type": "post_liked",
            "actor_id": Uuid::nil(),
            "post_id": Uuid::nil(),
            "author_id": Uuid::nil(),
        });
        let event: SocialEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(event, SocialEvent::PostLiked { .. }));
    }
}
