//! 通知实体、聚合规则与拉取检查点

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{ConversationId, MessageId, NotificationId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Follow,
    PostLike,
    CommentLike,
    PrayerRequestLike,
    CommentOnPost,
    CommentOnPrayerRequest,
    NewMessage,
}

impl NotificationType {
    /// `*_LIKE` 和 `COMMENT_ON_*` 在聚合窗口内合并为一条
    pub fn is_aggregatable(&self) -> bool {
        matches!(
            self,
            NotificationType::PostLike
                | NotificationType::CommentLike
                | NotificationType::PrayerRequestLike
                | NotificationType::CommentOnPost
                | NotificationType::CommentOnPrayerRequest
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Follow => "FOLLOW",
            NotificationType::PostLike => "POST_LIKE",
            NotificationType::CommentLike => "COMMENT_LIKE",
            NotificationType::PrayerRequestLike => "PRAYER_REQUEST_LIKE",
            NotificationType::CommentOnPost => "COMMENT_ON_POST",
            NotificationType::CommentOnPrayerRequest => "COMMENT_ON_PRAYER_REQUEST",
            NotificationType::NewMessage => "NEW_MESSAGE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let parsed = match value {
            "FOLLOW" => NotificationType::Follow,
            "POST_LIKE" => NotificationType::PostLike,
            "COMMENT_LIKE" => NotificationType::CommentLike,
            "PRAYER_REQUEST_LIKE" => NotificationType::PrayerRequestLike,
            "COMMENT_ON_POST" => NotificationType::CommentOnPost,
            "COMMENT_ON_PRAYER_REQUEST" => NotificationType::CommentOnPrayerRequest,
            "NEW_MESSAGE" => NotificationType::NewMessage,
            _ => return None,
        };
        Some(parsed)
    }
}

/// 通知指向的外部对象类型（CRUD 领域里的外键，此处不透明）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    User,
    Post,
    Comment,
    PrayerRequest,
    Message,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::User => "user",
            TargetKind::Post => "post",
            TargetKind::Comment => "comment",
            TargetKind::PrayerRequest => "prayer_request",
            TargetKind::Message => "message",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let parsed = match value {
            "user" => TargetKind::User,
            "post" => TargetKind::Post,
            "comment" => TargetKind::Comment,
            "prayer_request" => TargetKind::PrayerRequest,
            "message" => TargetKind::Message,
            _ => return None,
        };
        Some(parsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub id: Uuid,
    pub kind: TargetKind,
}

/// 尚未落库的通知请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDraft {
    pub recipient_id: UserId,
    pub notification_type: NotificationType,
    pub actor_id: UserId,
    pub target: NotificationTarget,
    pub conversation_id: Option<ConversationId>,
    pub message_id: Option<MessageId>,
}

impl NotificationDraft {
    pub fn is_self_action(&self) -> bool {
        self.actor_id == self.recipient_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_id: UserId,
    pub notification_type: NotificationType,
    /// 首个触发者
    pub actor_id: UserId,
    pub target: NotificationTarget,
    pub conversation_id: Option<ConversationId>,
    pub message_id: Option<MessageId>,
    pub created_at: Timestamp,
    /// 最近一次合并的时间，缺省等于 created_at
    pub updated_at: Timestamp,
    pub actor_ids: Vec<UserId>,
    pub actors_count: u32,
    pub last_actor_id: UserId,
}

impl Notification {
    pub fn from_draft(id: NotificationId, draft: NotificationDraft, now: Timestamp) -> Self {
        Self {
            id,
            recipient_id: draft.recipient_id,
            notification_type: draft.notification_type,
            actor_id: draft.actor_id,
            target: draft.target,
            conversation_id: draft.conversation_id,
            message_id: draft.message_id,
            created_at: now,
            updated_at: now,
            actor_ids: vec![draft.actor_id],
            actors_count: 1,
            last_actor_id: draft.actor_id,
        }
    }

    /// 判断草稿是否落在本条通知的聚合键与窗口内
    pub fn accepts(
        &self,
        draft: &NotificationDraft,
        window: chrono::Duration,
        now: Timestamp,
    ) -> bool {
        self.notification_type.is_aggregatable()
            && self.recipient_id == draft.recipient_id
            && self.notification_type == draft.notification_type
            && self.target == draft.target
            && now.signed_duration_since(self.created_at) <= window
    }

    /// 合并一次新的触发。新出现的 actor 才增加计数，返回是否为新 actor。
    pub fn absorb(&mut self, actor: UserId, now: Timestamp) -> bool {
        let is_new = !self.actor_ids.contains(&actor);
        if is_new {
            self.actor_ids.push(actor);
            self.actors_count = self.actor_ids.len() as u32;
        }
        self.last_actor_id = actor;
        if now > self.updated_at {
            self.updated_at = now;
        }
        is_new
    }
}

/// 补发拉取的位置，按 `(created_at, id)` 排序
///
/// `through` 为空表示 `at` 及之前创建的通知都已取走；
/// 否则 `at` 这一时刻只取到 id 不大于 `through` 的那条为止，同一时刻的其余通知留给下一次。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCursor {
    pub at: Timestamp,
    #[serde(default)]
    pub through: Option<NotificationId>,
}

impl FetchCursor {
    pub fn drained(at: Timestamp) -> Self {
        Self { at, through: None }
    }

    /// 截断时停在最后一条已返回的通知上
    pub fn after(notification: &Notification) -> Self {
        Self {
            at: notification.created_at,
            through: Some(notification.id),
        }
    }

    /// 通知是否位于该位置之后（尚未被取走）
    pub fn admits(&self, notification: &Notification) -> bool {
        match self.through {
            None => notification.created_at > self.at,
            Some(through) => (notification.created_at, notification.id) > (self.at, through),
        }
    }
}

impl Ord for FetchCursor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // 同一时刻下 None 覆盖全部 id，排在任何具体 id 之后
        self.at.cmp(&other.at).then_with(|| match (self.through, other.through) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (Some(a), Some(b)) => a.cmp(&b),
        })
    }
}

impl PartialOrd for FetchCursor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// 每个用户一行的通知拉取检查点，只增不减
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCheckpoint {
    pub user_id: UserId,
    pub last_fetch_at: Option<Timestamp>,
    pub last_notification_id: Option<NotificationId>,
}

impl FetchCheckpoint {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            last_fetch_at: None,
            last_notification_id: None,
        }
    }

    pub fn cursor(&self) -> Option<FetchCursor> {
        self.last_fetch_at.map(|at| FetchCursor {
            at,
            through: self.last_notification_id,
        })
    }

    /// 前进检查点，返回是否真的发生了移动
    pub fn advance(&mut self, to: FetchCursor) -> bool {
        if self.cursor().is_some_and(|current| current >= to) {
            return false;
        }
        self.last_fetch_at = Some(to.at);
        self.last_notification_id = to.through;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn like_draft(recipient: UserId, actor: UserId, post: Uuid) -> NotificationDraft {
        NotificationDraft {
            recipient_id: recipient,
            notification_type: NotificationType::PostLike,
            actor_id: actor,
            target: NotificationTarget {
                id: post,
                kind: TargetKind::Post,
            },
            conversation_id: None,
            message_id: None,
        }
    }

    #[test]
    fn aggregatable_types() {
        assert!(NotificationType::PostLike.is_aggregatable());
        assert!(NotificationType::CommentOnPrayerRequest.is_aggregatable());
        assert!(!NotificationType::Follow.is_aggregatable());
        assert!(!NotificationType::NewMessage.is_aggregatable());
    }

    #[test]
    fn absorb_counts_distinct_actors_only() {
        let now = Utc::now();
        let recipient = UserId::generate();
        let first = UserId::generate();
        let second = UserId::generate();
        let post = Uuid::new_v4();

        let mut notification =
            Notification::from_draft(NotificationId::generate(), like_draft(recipient, first, post), now);
        assert!(notification.absorb(second, now + Duration::minutes(1)));
        assert!(!notification.absorb(first, now + Duration::minutes(2)));

        assert_eq!(notification.actors_count, 2);
        assert_eq!(notification.last_actor_id, first);
        assert_eq!(notification.updated_at, now + Duration::minutes(2));
        assert_eq!(notification.created_at, now);
    }

    #[test]
    fn accepts_respects_window_and_target() {
        let now = Utc::now();
        let recipient = UserId::generate();
        let post = Uuid::new_v4();
        let notification = Notification::from_draft(
            NotificationId::generate(),
            like_draft(recipient, UserId::generate(), post),
            now,
        );
        let window = Duration::hours(24);

        let same = like_draft(recipient, UserId::generate(), post);
        assert!(notification.accepts(&same, window, now + Duration::hours(23)));
        assert!(!notification.accepts(&same, window, now + Duration::hours(25)));

        let other_post = like_draft(recipient, UserId::generate(), Uuid::new_v4());
        assert!(!notification.accepts(&other_post, window, now));
    }

    #[test]
    fn checkpoint_is_monotonic() {
        let now = Utc::now();
        let mut checkpoint = FetchCheckpoint::empty(UserId::generate());
        assert!(checkpoint.advance(FetchCursor::drained(now)));
        assert!(!checkpoint.advance(FetchCursor::drained(now - Duration::seconds(5))));
        assert_eq!(checkpoint.last_fetch_at, Some(now));
    }

    #[test]
    fn drained_cursor_is_ahead_of_any_id_at_the_same_instant() {
        let now = Utc::now();
        let notification = Notification::from_draft(
            NotificationId::generate(),
            like_draft(UserId::generate(), UserId::generate(), Uuid::new_v4()),
            now,
        );
        let partial = FetchCursor::after(&notification);

        assert!(FetchCursor::drained(now) > partial);
        assert!(!partial.admits(&notification));
        assert!(!FetchCursor::drained(now).admits(&notification));
        assert!(FetchCursor::drained(now - Duration::seconds(1)).admits(&notification));

        let mut checkpoint = FetchCheckpoint::empty(notification.recipient_id);
        assert!(checkpoint.advance(FetchCursor::drained(now)));
        assert!(!checkpoint.advance(partial));
        assert_eq!(checkpoint.last_notification_id, None);
    }
}
