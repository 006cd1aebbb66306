use application::NotificationRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ConversationId, FetchCheckpoint, FetchCursor, MessageId, Notification, NotificationDraft, NotificationId,
    NotificationTarget, NotificationType, RepositoryError, TargetKind, Timestamp, UserId,
};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{invalid_data, map_sqlx_err};

const NOTIFICATION_COLUMNS: &str = "id, recipient_id, notification_type, actor_id, target_id, \
    target_kind, conversation_id, message_id, created_at, updated_at, actor_ids, actors_count, \
    last_actor_id";

#[derive(Debug, FromRow)]
struct NotificationRecord {
    id: Uuid,
    recipient_id: Uuid,
    notification_type: String,
    actor_id: Uuid,
    target_id: Uuid,
    target_kind: String,
    conversation_id: Option<Uuid>,
    message_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    actor_ids: Vec<Uuid>,
    actors_count: i32,
    last_actor_id: Uuid,
}

impl TryFrom<NotificationRecord> for Notification {
    type Error = RepositoryError;

    fn try_from(value: NotificationRecord) -> Result<Self, Self::Error> {
        let notification_type = NotificationType::parse(&value.notification_type).ok_or_else(
            || invalid_data(format!("unknown notification type {}", value.notification_type)),
        )?;
        let kind = TargetKind::parse(&value.target_kind)
            .ok_or_else(|| invalid_data(format!("unknown target kind {}", value.target_kind)))?;

        Ok(Notification {
            id: NotificationId::from(value.id),
            recipient_id: UserId::from(value.recipient_id),
            notification_type,
            actor_id: UserId::from(value.actor_id),
            target: NotificationTarget {
                id: value.target_id,
                kind,
            },
            conversation_id: value.conversation_id.map(ConversationId::from),
            message_id: value.message_id.map(MessageId::from),
            created_at: value.created_at,
            updated_at: value.updated_at,
            actor_ids: value.actor_ids.into_iter().map(UserId::from).collect(),
            actors_count: u32::try_from(value.actors_count).unwrap_or_default(),
            last_actor_id: UserId::from(value.last_actor_id),
        })
    }
}

#[derive(Debug, FromRow)]
struct CheckpointRecord {
    user_id: Uuid,
    last_fetch_at: Option<DateTime<Utc>>,
    last_notification_id: Option<Uuid>,
}

impl From<CheckpointRecord> for FetchCheckpoint {
    fn from(value: CheckpointRecord) -> Self {
        FetchCheckpoint {
            user_id: UserId::from(value.user_id),
            last_fetch_at: value.last_fetch_at,
            last_notification_id: value.last_notification_id.map(NotificationId::from),
        }
    }
}

const CHECKPOINT_COLUMNS: &str = "user_id, last_fetch_at, last_notification_id";

const MAX_UUID: &str = "ffffffff-ffff-ffff-ffff-ffffffffffff";

fn actor_uuids(notification: &Notification) -> Vec<Uuid> {
    notification.actor_ids.iter().copied().map(Uuid::from).collect()
}

fn aggregation_key(draft: &NotificationDraft) -> String {
    format!(
        "{}:{}:{}:{}",
        draft.recipient_id,
        draft.notification_type.as_str(),
        draft.target.kind.as_str(),
        draft.target.id
    )
}

#[derive(Clone)]
pub struct PgNotificationRepository {
    pool: PgPool,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_with<'e, E>(
        executor: E,
        notification: &Notification,
    ) -> Result<NotificationRecord, sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query_as::<_, NotificationRecord>(&format!(
            r#"
            INSERT INTO notifications ({NOTIFICATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(Uuid::from(notification.id))
        .bind(Uuid::from(notification.recipient_id))
        .bind(notification.notification_type.as_str())
        .bind(Uuid::from(notification.actor_id))
        .bind(notification.target.id)
        .bind(notification.target.kind.as_str())
        .bind(notification.conversation_id.map(Uuid::from))
        .bind(notification.message_id.map(Uuid::from))
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .bind(actor_uuids(notification))
        .bind(i32::try_from(notification.actors_count).unwrap_or(i32::MAX))
        .bind(Uuid::from(notification.last_actor_id))
        .fetch_one(executor)
        .await
    }

    async fn aggregate_in(
        tx: &mut Transaction<'_, Postgres>,
        draft: NotificationDraft,
        window: chrono::Duration,
        now: Timestamp,
    ) -> Result<NotificationRecord, RepositoryError> {
        // 同一聚合键的写入在事务内串行化，锁随事务结束释放
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(aggregation_key(&draft))
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_err)?;

        let existing = sqlx::query_as::<_, NotificationRecord>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS} FROM notifications
            WHERE recipient_id = $1
              AND notification_type = $2
              AND target_kind = $3
              AND target_id = $4
              AND created_at >= $5
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#
        ))
        .bind(Uuid::from(draft.recipient_id))
        .bind(draft.notification_type.as_str())
        .bind(draft.target.kind.as_str())
        .bind(draft.target.id)
        .bind(now - window)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;

        let Some(record) = existing else {
            let fresh = Notification::from_draft(NotificationId::generate(), draft, now);
            return Self::insert_with(&mut **tx, &fresh)
                .await
                .map_err(map_sqlx_err);
        };

        let id = record.id;
        let mut notification = Notification::try_from(record)?;
        notification.absorb(draft.actor_id, now);

        sqlx::query_as::<_, NotificationRecord>(&format!(
            r#"
            UPDATE notifications
            SET actor_ids = $2, actors_count = $3, last_actor_id = $4, updated_at = $5
            WHERE id = $1
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(actor_uuids(&notification))
        .bind(i32::try_from(notification.actors_count).unwrap_or(i32::MAX))
        .bind(Uuid::from(notification.last_actor_id))
        .bind(notification.updated_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx_err)
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    async fn insert(&self, notification: Notification) -> Result<Notification, RepositoryError> {
        let record = Self::insert_with(&self.pool, &notification)
            .await
            .map_err(map_sqlx_err)?;
        Notification::try_from(record)
    }

    async fn upsert_aggregated(
        &self,
        draft: NotificationDraft,
        window: chrono::Duration,
        now: Timestamp,
    ) -> Result<Notification, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let record = Self::aggregate_in(&mut tx, draft, window, now).await?;
        tx.commit().await.map_err(map_sqlx_err)?;

        Notification::try_from(record)
    }

    async fn list_created_after(
        &self,
        recipient: UserId,
        after: FetchCursor,
        until: Timestamp,
        limit: u32,
    ) -> Result<Vec<Notification>, RepositoryError> {
        let records = sqlx::query_as::<_, NotificationRecord>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS} FROM notifications
            WHERE recipient_id = $1
              AND (created_at > $2 OR ($3::uuid IS NOT NULL AND created_at = $2 AND id > $3))
              AND created_at <= $4
            ORDER BY created_at, id
            LIMIT $5
            "#
        ))
        .bind(Uuid::from(recipient))
        .bind(after.at)
        .bind(after.through.map(Uuid::from))
        .bind(until)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Notification::try_from).collect()
    }

    async fn find_checkpoint(&self, user_id: UserId) -> Result<FetchCheckpoint, RepositoryError> {
        let record = sqlx::query_as::<_, CheckpointRecord>(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM notification_checkpoints WHERE user_id = $1"
        ))
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record
            .map(FetchCheckpoint::from)
            .unwrap_or_else(|| FetchCheckpoint::empty(user_id)))
    }

    async fn advance_checkpoint(
        &self,
        user_id: UserId,
        to: FetchCursor,
    ) -> Result<FetchCheckpoint, RepositoryError> {
        // NULL id 表示该时刻已全部取完，比较时按最大 uuid 处理
        sqlx::query(&format!(
            r#"
            INSERT INTO notification_checkpoints (user_id, last_fetch_at, last_notification_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET last_fetch_at = EXCLUDED.last_fetch_at,
                last_notification_id = EXCLUDED.last_notification_id
            WHERE notification_checkpoints.last_fetch_at IS NULL
               OR (EXCLUDED.last_fetch_at, COALESCE(EXCLUDED.last_notification_id, '{MAX_UUID}'::uuid))
                > (notification_checkpoints.last_fetch_at,
                   COALESCE(notification_checkpoints.last_notification_id, '{MAX_UUID}'::uuid))
            "#
        ))
        .bind(Uuid::from(user_id))
        .bind(to.at)
        .bind(to.through.map(Uuid::from))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        self.find_checkpoint(user_id).await
    }
}
