use application::{MessageRepository, ReadReceiptRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    AttachmentDescriptor, AttachmentKind, ConversationId, Message, MessageId, MessageText,
    ReadReceipt, RepositoryError, Timestamp, UserId,
};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{invalid_data, map_sqlx_err};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, text, attachment_url, \
    attachment_kind, attachment_size, attachment_name, reply_to, shared_content_id, \
    created_at, edited_at, is_deleted";

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    text: String,
    attachment_url: Option<String>,
    attachment_kind: Option<String>,
    attachment_size: Option<i64>,
    attachment_name: Option<String>,
    reply_to: Option<Uuid>,
    shared_content_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    edited_at: Option<DateTime<Utc>>,
    is_deleted: bool,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let attachment = match value.attachment_url {
            Some(url) => {
                let kind = value
                    .attachment_kind
                    .as_deref()
                    .and_then(AttachmentKind::parse)
                    .ok_or_else(|| invalid_data("attachment without a valid kind"))?;
                let size = u64::try_from(value.attachment_size.unwrap_or_default())
                    .map_err(|_| invalid_data("negative attachment size"))?;
                Some(AttachmentDescriptor {
                    url,
                    kind,
                    size,
                    name: value.attachment_name.unwrap_or_default(),
                })
            }
            None => None,
        };

        Ok(Message {
            id: MessageId::from(value.id),
            conversation_id: ConversationId::from(value.conversation_id),
            sender_id: UserId::from(value.sender_id),
            text: MessageText::restore(value.text),
            attachment,
            reply_to: value.reply_to.map(MessageId::from),
            shared_content_id: value.shared_content_id,
            created_at: value.created_at,
            edited_at: value.edited_at,
            is_deleted: value.is_deleted,
        })
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let attachment = message.attachment.as_ref();
        let attachment_size = attachment
            .map(|a| i64::try_from(a.size))
            .transpose()
            .map_err(|_| invalid_data("attachment too large"))?;

        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            INSERT INTO messages ({MESSAGE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.conversation_id))
        .bind(Uuid::from(message.sender_id))
        .bind(message.text.as_str())
        .bind(attachment.map(|a| a.url.as_str()))
        .bind(attachment.map(|a| a.kind.as_str()))
        .bind(attachment_size)
        .bind(attachment.map(|a| a.name.as_str()))
        .bind(message.reply_to.map(Uuid::from))
        .bind(message.shared_content_id)
        .bind(message.created_at)
        .bind(message.edited_at)
        .bind(message.is_deleted)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Message::try_from(record)
    }

    // 只有正文、编辑时间和删除标记会变化
    async fn update(&self, message: Message) -> Result<Message, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            UPDATE messages
            SET text = $2, edited_at = $3, is_deleted = $4
            WHERE id = $1
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::from(message.id))
        .bind(message.text.as_str())
        .bind(message.edited_at)
        .bind(message.is_deleted)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(RepositoryError::NotFound)?;

        Message::try_from(record)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        // 游标不存在时子查询为 NULL，比较结果为空集
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = $1
              AND ($3::uuid IS NULL
                   OR (created_at, id) < (SELECT created_at, id FROM messages WHERE id = $3))
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(Uuid::from(conversation_id))
        .bind(i64::from(limit))
        .bind(before.map(Uuid::from))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn latest(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(Uuid::from(conversation_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn count_unread(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
        since: Option<Timestamp>,
    ) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE conversation_id = $1
              AND sender_id <> $2
              AND NOT is_deleted
              AND ($3::timestamptz IS NULL OR created_at > $3)
            "#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(reader))
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[derive(Debug, FromRow)]
struct ReceiptRecord {
    message_id: Uuid,
    user_id: Uuid,
    read_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PgReadReceiptRepository {
    pool: PgPool,
}

impl PgReadReceiptRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReadReceiptRepository for PgReadReceiptRepository {
    async fn upsert(&self, receipt: ReadReceipt) -> Result<ReadReceipt, RepositoryError> {
        let record = sqlx::query_as::<_, ReceiptRecord>(
            r#"
            INSERT INTO message_read_receipts (message_id, user_id, read_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id, user_id) DO UPDATE
            SET read_at = LEAST(message_read_receipts.read_at, EXCLUDED.read_at)
            RETURNING message_id, user_id, read_at
            "#,
        )
        .bind(Uuid::from(receipt.message_id))
        .bind(Uuid::from(receipt.user_id))
        .bind(receipt.read_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(ReadReceipt {
            message_id: MessageId::from(record.message_id),
            user_id: UserId::from(record.user_id),
            read_at: record.read_at,
        })
    }
}
