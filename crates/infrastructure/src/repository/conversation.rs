use application::{ConversationRepository, MembershipRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    Conversation, ConversationId, ConversationKind, Membership, RepositoryError, UserId,
};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{invalid_data, map_sqlx_err};

const CONVERSATION_COLUMNS: &str =
    "id, kind, name, description, created_by, is_active, created_at, updated_at";
const MEMBER_COLUMNS: &str =
    "conversation_id, user_id, is_admin, joined_at, left_at, last_read_at";

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    kind: String,
    name: Option<String>,
    description: Option<String>,
    created_by: Uuid,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConversationRecord> for Conversation {
    type Error = RepositoryError;

    fn try_from(value: ConversationRecord) -> Result<Self, Self::Error> {
        let kind = ConversationKind::parse(&value.kind)
            .ok_or_else(|| invalid_data(format!("unknown conversation kind {}", value.kind)))?;
        Ok(Conversation {
            id: ConversationId::from(value.id),
            kind,
            name: value.name,
            description: value.description,
            created_by: UserId::from(value.created_by),
            is_active: value.is_active,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MemberRecord {
    conversation_id: Uuid,
    user_id: Uuid,
    is_admin: bool,
    joined_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
    last_read_at: Option<DateTime<Utc>>,
}

impl From<MemberRecord> for Membership {
    fn from(value: MemberRecord) -> Self {
        Membership {
            conversation_id: ConversationId::from(value.conversation_id),
            user_id: UserId::from(value.user_id),
            is_admin: value.is_admin,
            joined_at: value.joined_at,
            left_at: value.left_at,
            last_read_at: value.last_read_at,
        }
    }
}

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            r#"
            INSERT INTO conversations ({CONVERSATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(Uuid::from(conversation.id))
        .bind(conversation.kind.as_str())
        .bind(&conversation.name)
        .bind(&conversation.description)
        .bind(Uuid::from(conversation.created_by))
        .bind(conversation.is_active)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Conversation::try_from(record)
    }

    async fn update(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            r#"
            UPDATE conversations
            SET name = $2, description = $3, is_active = $4, updated_at = $5
            WHERE id = $1
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(Uuid::from(conversation.id))
        .bind(&conversation.name)
        .bind(&conversation.description)
        .bind(conversation.is_active)
        .bind(conversation.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(RepositoryError::NotFound)?;

        Conversation::try_from(record)
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Conversation::try_from).transpose()
    }

    async fn find_direct(
        &self,
        first: UserId,
        second: UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT c.id, c.kind, c.name, c.description, c.created_by, c.is_active,
                   c.created_at, c.updated_at
            FROM conversations c
            JOIN conversation_members a
              ON a.conversation_id = c.id AND a.user_id = $1 AND a.left_at IS NULL
            JOIN conversation_members b
              ON b.conversation_id = c.id AND b.user_id = $2 AND b.left_at IS NULL
            WHERE c.kind = 'DIRECT' AND c.is_active
            ORDER BY c.created_at
            LIMIT 1
            "#,
        )
        .bind(Uuid::from(first))
        .bind(Uuid::from(second))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Conversation::try_from).transpose()
    }
}

#[derive(Clone)]
pub struct PgMembershipRepository {
    pool: PgPool,
}

impl PgMembershipRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipRepository for PgMembershipRepository {
    async fn upsert(&self, membership: Membership) -> Result<Membership, RepositoryError> {
        let record = sqlx::query_as::<_, MemberRecord>(&format!(
            r#"
            INSERT INTO conversation_members ({MEMBER_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (conversation_id, user_id) DO UPDATE
            SET is_admin = EXCLUDED.is_admin,
                joined_at = EXCLUDED.joined_at,
                left_at = EXCLUDED.left_at,
                last_read_at = EXCLUDED.last_read_at
            RETURNING {MEMBER_COLUMNS}
            "#
        ))
        .bind(Uuid::from(membership.conversation_id))
        .bind(Uuid::from(membership.user_id))
        .bind(membership.is_admin)
        .bind(membership.joined_at)
        .bind(membership.left_at)
        .bind(membership.last_read_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.into())
    }

    async fn find(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Membership>, RepositoryError> {
        let record = sqlx::query_as::<_, MemberRecord>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM conversation_members \
             WHERE conversation_id = $1 AND user_id = $2"
        ))
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(Membership::from))
    }

    async fn list_active(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Membership>, RepositoryError> {
        let records = sqlx::query_as::<_, MemberRecord>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM conversation_members \
             WHERE conversation_id = $1 AND left_at IS NULL ORDER BY joined_at"
        ))
        .bind(Uuid::from(conversation_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(records.into_iter().map(Membership::from).collect())
    }

    async fn list_active_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Membership>, RepositoryError> {
        let records = sqlx::query_as::<_, MemberRecord>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM conversation_members \
             WHERE user_id = $1 AND left_at IS NULL"
        ))
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(records.into_iter().map(Membership::from).collect())
    }
}
