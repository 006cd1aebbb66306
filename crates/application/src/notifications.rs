//! 通知聚合器
//!
//! 由 CRUD 写路径显式调用，不依赖聊天会话。点赞、评论类事件在聚合窗口内合并为一条通知，
//! 关注和私信通知每次都单独成行。投递到用户个人分组失败只记日志，不影响调用方。
//!
//! 补发拉取以每个用户的 [`domain::FetchCheckpoint`] 为下界，按 `(created_at, id)` 分页；
//! 只有客户端确认后检查点才前进。确认之后才合并进旧行的点赞只走实时推送，不会再被补发。

use std::sync::Arc;

use domain::{FetchCursor, Notification, NotificationDraft, NotificationId, SocialEvent, UserId};

use crate::clock::Clock;
use crate::dto::MissedNotifications;
use crate::error::ApplicationError;
use crate::fanout::{FanoutBus, FanoutEvent, GroupName};
use crate::repository::NotificationRepository;

pub const NOTIFICATION_EVENT: &str = "notification.new";

pub struct NotificationAggregator {
    repository: Arc<dyn NotificationRepository>,
    bus: Arc<dyn FanoutBus>,
    clock: Arc<dyn Clock>,
    aggregation_window: chrono::Duration,
    replay_window: chrono::Duration,
    replay_limit: u32,
}

impl NotificationAggregator {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        bus: Arc<dyn FanoutBus>,
        clock: Arc<dyn Clock>,
        config: &config::NotificationConfig,
    ) -> Self {
        Self {
            repository,
            bus,
            clock,
            aggregation_window: chrono::Duration::seconds(config.aggregation_window_secs),
            replay_window: chrono::Duration::seconds(config.replay_window_secs),
            replay_limit: config.replay_limit,
        }
    }

    /// 写入或合并一条通知并投递给接收者。自己对自己的操作返回 `None`。
    pub async fn record(
        &self,
        draft: NotificationDraft,
    ) -> Result<Option<Notification>, ApplicationError> {
        if draft.is_self_action() {
            tracing::debug!(user_id = %draft.actor_id, "忽略用户对自己内容的操作");
            return Ok(None);
        }

        let now = self.clock.now();
        let notification = if draft.notification_type.is_aggregatable() {
            self.repository
                .upsert_aggregated(draft, self.aggregation_window, now)
                .await?
        } else {
            let notification = Notification::from_draft(NotificationId::generate(), draft, now);
            self.repository.insert(notification).await?
        };

        tracing::debug!(
            notification_id = %notification.id,
            recipient_id = %notification.recipient_id,
            notification_type = notification.notification_type.as_str(),
            actors_count = notification.actors_count,
            "通知已记录"
        );

        self.deliver(&notification).await;
        Ok(Some(notification))
    }

    /// CRUD 侧入口：任何失败都只记日志，绝不让点赞、关注等原操作失败
    pub async fn dispatch(&self, event: SocialEvent) -> Option<Notification> {
        match self.record(event.into_draft()).await {
            Ok(notification) => notification,
            Err(err) => {
                tracing::warn!(error = %err, "通知写入失败，已忽略");
                None
            }
        }
    }

    /// 拉取检查点之后（从未拉取则为最近一段时间内）创建的通知，不移动检查点
    pub async fn fetch_missed(
        &self,
        user_id: UserId,
    ) -> Result<MissedNotifications, ApplicationError> {
        let now = self.clock.now();
        let checkpoint = self.repository.find_checkpoint(user_id).await?;
        let after = checkpoint
            .cursor()
            .unwrap_or_else(|| FetchCursor::drained(now - self.replay_window));

        let notifications = self
            .repository
            .list_created_after(user_id, after, now, self.replay_limit)
            .await?;

        // 截断时停在已返回的最后一条上，同一时刻剩下的通知留给下一次拉取
        let cursor = match notifications.last() {
            Some(last) if notifications.len() as u32 >= self.replay_limit => {
                FetchCursor::after(last)
            }
            _ => FetchCursor::drained(now),
        };

        Ok(MissedNotifications {
            notifications,
            cursor,
        })
    }

    /// 客户端确认收到一次拉取结果后推进检查点，返回推进后的位置
    pub async fn acknowledge(
        &self,
        user_id: UserId,
        cursor: FetchCursor,
    ) -> Result<FetchCursor, ApplicationError> {
        let now = self.clock.now();
        let target = if cursor.at > now {
            FetchCursor::drained(now)
        } else {
            cursor
        };
        let checkpoint = self.repository.advance_checkpoint(user_id, target).await?;
        Ok(checkpoint.cursor().unwrap_or(target))
    }

    /// 把检查点推进到当前时间
    pub async fn mark_all_read(&self, user_id: UserId) -> Result<FetchCursor, ApplicationError> {
        let now = self.clock.now();
        self.acknowledge(user_id, FetchCursor::drained(now)).await
    }

    async fn deliver(&self, notification: &Notification) {
        let data = match serde_json::to_value(notification) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(notification_id = %notification.id, error = %err, "通知序列化失败");
                return;
            }
        };

        let group = GroupName::User(notification.recipient_id);
        if let Err(err) = self
            .bus
            .publish(group, FanoutEvent::durable(NOTIFICATION_EVENT, data))
            .await
        {
            tracing::warn!(
                notification_id = %notification.id,
                recipient_id = %notification.recipient_id,
                error = %err,
                "通知投递失败，已忽略"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fanout::{FanoutError, LocalFanoutBus, SessionSink, SubscriptionHandle};
    use crate::memory::MemoryNotificationRepository;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use domain::NotificationType;
    use uuid::Uuid;

    struct UnreachableBus;

    #[async_trait]
    impl FanoutBus for UnreachableBus {
        async fn publish(&self, _: GroupName, _: FanoutEvent) -> Result<(), FanoutError> {
            Err(FanoutError::Publish("connection refused".into()))
        }

        async fn subscribe(
            &self,
            _: GroupName,
            _: SessionSink,
        ) -> Result<SubscriptionHandle, FanoutError> {
            Err(FanoutError::Publish("connection refused".into()))
        }

        async fn unsubscribe(&self, _: SubscriptionHandle) -> Result<(), FanoutError> {
            Ok(())
        }
    }

    struct Fixture {
        repository: Arc<MemoryNotificationRepository>,
        clock: Arc<ManualClock>,
        aggregator: NotificationAggregator,
    }

    fn fixture_with(bus: Arc<dyn FanoutBus>, replay_limit: u32) -> Fixture {
        let repository = Arc::new(MemoryNotificationRepository::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let config = config::NotificationConfig {
            replay_limit,
            ..Default::default()
        };
        let aggregator =
            NotificationAggregator::new(repository.clone(), bus, clock.clone(), &config);
        Fixture {
            repository,
            clock,
            aggregator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(LocalFanoutBus::new()), 200)
    }

    fn like(actor_id: UserId, post_id: Uuid, author_id: UserId) -> SocialEvent {
        SocialEvent::PostLiked {
            actor_id,
            post_id,
            author_id,
        }
    }

    #[tokio::test]
    async fn likes_on_one_post_collapse_into_one_row() {
        let f = fixture();
        let author = UserId::generate();
        let post = Uuid::new_v4();
        let fans: Vec<UserId> = (0..3).map(|_| UserId::generate()).collect();

        for fan in &fans {
            f.aggregator.dispatch(like(*fan, post, author)).await;
            f.clock.advance(Duration::minutes(5));
        }

        let rows = f.repository.for_recipient(author);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].actors_count, 3);
        assert_eq!(rows[0].last_actor_id, fans[2]);

        f.aggregator.dispatch(like(fans[0], post, author)).await;
        let rows = f.repository.for_recipient(author);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].actors_count, 3);
        assert_eq!(rows[0].last_actor_id, fans[0]);
    }

    #[tokio::test]
    async fn likes_after_the_window_start_a_new_row() {
        let f = fixture();
        let author = UserId::generate();
        let post = Uuid::new_v4();

        f.aggregator
            .dispatch(like(UserId::generate(), post, author))
            .await;
        f.clock.advance(Duration::hours(24) + Duration::seconds(1));
        f.aggregator
            .dispatch(like(UserId::generate(), post, author))
            .await;

        assert_eq!(f.repository.for_recipient(author).len(), 2);
    }

    #[tokio::test]
    async fn self_actions_produce_nothing() {
        let f = fixture();
        let author = UserId::generate();

        let liked = f.aggregator.dispatch(like(author, Uuid::new_v4(), author)).await;
        let commented = f
            .aggregator
            .dispatch(SocialEvent::CommentedOnPost {
                actor_id: author,
                post_id: Uuid::new_v4(),
                author_id: author,
            })
            .await;

        assert!(liked.is_none());
        assert!(commented.is_none());
        assert!(f.repository.for_recipient(author).is_empty());
    }

    #[tokio::test]
    async fn follows_are_never_aggregated() {
        let f = fixture();
        let followee = UserId::generate();

        for _ in 0..2 {
            f.aggregator
                .dispatch(SocialEvent::Followed {
                    follower_id: UserId::generate(),
                    followee_id: followee,
                })
                .await;
        }

        let rows = f.repository.for_recipient(followee);
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .all(|n| n.notification_type == NotificationType::Follow && n.actors_count == 1));
    }

    #[tokio::test]
    async fn message_notifications_are_never_aggregated() {
        let f = fixture();
        let sender = UserId::generate();
        let recipient = UserId::generate();
        let conversation_id = domain::ConversationId::generate();

        for _ in 0..2 {
            f.aggregator
                .dispatch(SocialEvent::MessageReceived {
                    sender_id: sender,
                    recipient_id: recipient,
                    conversation_id,
                    message_id: domain::MessageId::generate(),
                })
                .await;
        }

        let rows = f.repository.for_recipient(recipient);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|n| {
            n.notification_type == NotificationType::NewMessage
                && n.actors_count == 1
                && n.conversation_id == Some(conversation_id)
        }));
        assert_ne!(rows[0].message_id, rows[1].message_id);
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() {
        let f = fixture_with(Arc::new(UnreachableBus), 200);
        let author = UserId::generate();

        let notification = f
            .aggregator
            .dispatch(like(UserId::generate(), Uuid::new_v4(), author))
            .await;

        assert!(notification.is_some());
        assert_eq!(f.repository.for_recipient(author).len(), 1);
    }

    #[tokio::test]
    async fn notifications_reach_the_recipient_personal_group() {
        let bus = LocalFanoutBus::new();
        let f = fixture_with(Arc::new(bus.clone()), 200);
        let author = UserId::generate();
        let (sink, mut rx) = SessionSink::channel(8);
        bus.subscribe(GroupName::User(author), sink).await.unwrap();

        f.aggregator
            .dispatch(like(UserId::generate(), Uuid::new_v4(), author))
            .await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, NOTIFICATION_EVENT);
        assert_eq!(event.data["notification_type"], "POST_LIKE");
    }

    #[tokio::test]
    async fn consecutive_fetches_never_overlap() {
        let f = fixture();
        let user = UserId::generate();

        f.aggregator
            .dispatch(SocialEvent::Followed {
                follower_id: UserId::generate(),
                followee_id: user,
            })
            .await;
        f.clock.advance(Duration::seconds(10));

        let first = f.aggregator.fetch_missed(user).await.unwrap();
        assert_eq!(first.notifications.len(), 1);
        f.aggregator.acknowledge(user, first.cursor).await.unwrap();

        f.clock.advance(Duration::seconds(10));
        f.aggregator
            .dispatch(SocialEvent::Followed {
                follower_id: UserId::generate(),
                followee_id: user,
            })
            .await;
        f.clock.advance(Duration::seconds(10));

        let second = f.aggregator.fetch_missed(user).await.unwrap();
        assert_eq!(second.notifications.len(), 1);
        assert_ne!(second.notifications[0].id, first.notifications[0].id);
    }

    #[tokio::test]
    async fn unacknowledged_fetches_are_repeated() {
        let f = fixture();
        let user = UserId::generate();
        f.aggregator
            .dispatch(SocialEvent::Followed {
                follower_id: UserId::generate(),
                followee_id: user,
            })
            .await;
        f.clock.advance(Duration::seconds(1));

        let first = f.aggregator.fetch_missed(user).await.unwrap();
        let again = f.aggregator.fetch_missed(user).await.unwrap();
        assert_eq!(first.notifications, again.notifications);
    }

    #[tokio::test]
    async fn first_fetch_is_bounded_to_the_replay_window() {
        let f = fixture();
        let user = UserId::generate();
        f.aggregator
            .dispatch(SocialEvent::Followed {
                follower_id: UserId::generate(),
                followee_id: user,
            })
            .await;
        f.clock.advance(Duration::hours(25));

        let missed = f.aggregator.fetch_missed(user).await.unwrap();
        assert!(missed.notifications.is_empty());
    }

    #[tokio::test]
    async fn truncated_fetch_resumes_after_the_last_returned_row() {
        let f = fixture_with(Arc::new(LocalFanoutBus::new()), 2);
        let user = UserId::generate();
        for _ in 0..3 {
            f.aggregator
                .dispatch(SocialEvent::Followed {
                    follower_id: UserId::generate(),
                    followee_id: user,
                })
                .await;
            f.clock.advance(Duration::seconds(1));
        }

        let first = f.aggregator.fetch_missed(user).await.unwrap();
        assert_eq!(first.notifications.len(), 2);
        f.aggregator.acknowledge(user, first.cursor).await.unwrap();

        let rest = f.aggregator.fetch_missed(user).await.unwrap();
        assert_eq!(rest.notifications.len(), 1);
    }

    #[tokio::test]
    async fn mark_all_read_skips_everything_so_far() {
        let f = fixture();
        let user = UserId::generate();
        f.aggregator
            .dispatch(SocialEvent::Followed {
                follower_id: UserId::generate(),
                followee_id: user,
            })
            .await;
        f.clock.advance(Duration::seconds(1));

        f.aggregator.mark_all_read(user).await.unwrap();
        let missed = f.aggregator.fetch_missed(user).await.unwrap();
        assert!(missed.notifications.is_empty());
    }

    #[tokio::test]
    async fn truncation_inside_one_instant_loses_nothing() {
        let f = fixture_with(Arc::new(LocalFanoutBus::new()), 2);
        let user = UserId::generate();
        for _ in 0..3 {
            f.aggregator
                .dispatch(SocialEvent::Followed {
                    follower_id: UserId::generate(),
                    followee_id: user,
                })
                .await;
        }
        f.clock.advance(Duration::seconds(1));

        let first = f.aggregator.fetch_missed(user).await.unwrap();
        assert_eq!(first.notifications.len(), 2);
        assert!(first.cursor.through.is_some());
        f.aggregator.acknowledge(user, first.cursor).await.unwrap();

        let rest = f.aggregator.fetch_missed(user).await.unwrap();
        assert_eq!(rest.notifications.len(), 1);
        assert!(first
            .notifications
            .iter()
            .all(|n| n.id != rest.notifications[0].id));
        f.aggregator.acknowledge(user, rest.cursor).await.unwrap();

        let drained = f.aggregator.fetch_missed(user).await.unwrap();
        assert!(drained.notifications.is_empty());
    }

    #[tokio::test]
    async fn likes_merged_after_acknowledgment_are_not_replayed() {
        let f = fixture();
        let author = UserId::generate();
        let post = Uuid::new_v4();

        f.aggregator
            .dispatch(like(UserId::generate(), post, author))
            .await;
        f.clock.advance(Duration::seconds(10));
        let first = f.aggregator.fetch_missed(author).await.unwrap();
        assert_eq!(first.notifications.len(), 1);
        f.aggregator.acknowledge(author, first.cursor).await.unwrap();

        f.clock.advance(Duration::seconds(10));
        let merged = f
            .aggregator
            .dispatch(like(UserId::generate(), post, author))
            .await
            .unwrap();
        assert_eq!(merged.id, first.notifications[0].id);
        assert_eq!(merged.actors_count, 2);
        f.clock.advance(Duration::seconds(10));

        let again = f.aggregator.fetch_missed(author).await.unwrap();
        assert!(again.notifications.is_empty());
    }

    #[tokio::test]
    async fn acknowledging_the_future_stops_at_now() {
        let f = fixture();
        let user = UserId::generate();
        let now = f.clock.now();

        let stored = f
            .aggregator
            .acknowledge(user, FetchCursor::drained(now + Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(stored, FetchCursor::drained(now));

        f.clock.advance(Duration::seconds(1));
        f.aggregator
            .dispatch(SocialEvent::Followed {
                follower_id: UserId::generate(),
                followee_id: user,
            })
            .await;
        let missed = f.aggregator.fetch_missed(user).await.unwrap();
        assert_eq!(missed.notifications.len(), 1);
    }
}
