use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use application::dto::{
    ConversationDetail, CreateGroupRequest, InboxEntry, MissedNotifications, UploadedFile,
};
use domain::{
    Conversation, ConversationId, FetchCursor, Membership, MessageId, SocialEvent, UserId,
};

use crate::{auth::AuthUser, error::ApiError, state::AppState, ws_connection};

/// multipart 边界和字段头的余量
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CreateConversationPayload {
    Direct { user_id: UserId },
    Group(CreateGroupRequest),
}

#[derive(Debug, Deserialize)]
struct AddMembersPayload {
    user_ids: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    before: Option<MessageId>,
    limit: Option<u32>,
}

/// 原样回传 `/notifications/missed` 给出的 cursor
#[derive(Debug, Deserialize)]
struct AcknowledgePayload {
    cursor: FetchCursor,
}

#[derive(Debug, Serialize)]
struct CheckpointResponse {
    cursor: FetchCursor,
}

/// CRUD 侧上报的社交行为，触发者就是 token 对应的用户
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SocialEventPayload {
    Followed { followee_id: UserId },
    PostLiked { post_id: Uuid, author_id: UserId },
    CommentLiked { comment_id: Uuid, author_id: UserId },
    PrayerRequestLiked { prayer_request_id: Uuid, author_id: UserId },
    CommentedOnPost { post_id: Uuid, author_id: UserId },
    CommentedOnPrayerRequest { prayer_request_id: Uuid, author_id: UserId },
    MessageReceived {
        recipient_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}

impl SocialEventPayload {
    fn into_event(self, actor_id: UserId) -> SocialEvent {
        match self {
            SocialEventPayload::Followed { followee_id } => SocialEvent::Followed {
                follower_id: actor_id,
                followee_id,
            },
            SocialEventPayload::PostLiked { post_id, author_id } => SocialEvent::PostLiked {
                actor_id,
                post_id,
                author_id,
            },
            SocialEventPayload::CommentLiked {
                comment_id,
                author_id,
            } => SocialEvent::CommentLiked {
                actor_id,
                comment_id,
                author_id,
            },
            SocialEventPayload::PrayerRequestLiked {
                prayer_request_id,
                author_id,
            } => SocialEvent::PrayerRequestLiked {
                actor_id,
                prayer_request_id,
                author_id,
            },
            SocialEventPayload::CommentedOnPost { post_id, author_id } => {
                SocialEvent::CommentedOnPost {
                    actor_id,
                    post_id,
                    author_id,
                }
            }
            SocialEventPayload::CommentedOnPrayerRequest {
                prayer_request_id,
                author_id,
            } => SocialEvent::CommentedOnPrayerRequest {
                actor_id,
                prayer_request_id,
                author_id,
            },
            SocialEventPayload::MessageReceived {
                recipient_id,
                conversation_id,
                message_id,
            } => SocialEvent::MessageReceived {
                sender_id: actor_id,
                recipient_id,
                conversation_id,
                message_id,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct SocialEventResponse {
    recorded: bool,
}

pub fn router(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.max_upload_bytes + MULTIPART_OVERHEAD)
        .unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_connection::websocket_upgrade))
        .nest("/api/v1", api_routes(upload_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn api_routes(upload_limit: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/uploads",
            post(upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/inbox", get(inbox))
        .route("/conversations", post(create_conversation))
        .route(
            "/conversations/{conversation_id}",
            get(conversation_detail).delete(deactivate_conversation),
        )
        .route("/conversations/{conversation_id}/members", post(add_members))
        .route("/conversations/{conversation_id}/leave", post(leave_conversation))
        .route("/notifications/missed", get(missed_notifications))
        .route("/notifications/ack", post(acknowledge_notifications))
        .route("/notifications/read-all", post(mark_all_read))
        .route("/social-events", post(ingest_social_event))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn upload_file(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadedFile>), ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;

        let uploaded = state
            .upload_service
            .upload(&file_name, &content_type, bytes.to_vec())
            .await?;
        tracing::info!(user_id = %user_id, file_url = %uploaded.file_url, "文件已上传");
        return Ok((StatusCode::CREATED, Json(uploaded)));
    }

    Err(ApiError::bad_request("missing multipart field `file`"))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            application::ErrorCode::FileTooLarge.as_str(),
            err.body_text(),
        );
    }
    ApiError::bad_request(err.body_text())
}

async fn inbox(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<InboxEntry>>, ApiError> {
    let entries = state.conversation_service.inbox(user_id).await?;
    Ok(Json(entries))
}

async fn create_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CreateConversationPayload>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let conversation = match payload {
        CreateConversationPayload::Direct { user_id: other } => {
            state
                .conversation_service
                .create_direct(user_id, other)
                .await?
        }
        CreateConversationPayload::Group(request) => {
            state
                .conversation_service
                .create_group(user_id, request)
                .await?
        }
    };
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn conversation_detail(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ConversationDetail>, ApiError> {
    let detail = state
        .conversation_service
        .detail(conversation_id, user_id, query.before, query.limit)
        .await?;
    Ok(Json(detail))
}

async fn deactivate_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<ConversationId>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .conversation_service
        .deactivate(conversation_id, user_id)
        .await?;
    Ok(Json(conversation))
}

async fn add_members(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<ConversationId>,
    Json(payload): Json<AddMembersPayload>,
) -> Result<Json<Vec<Membership>>, ApiError> {
    let added = state
        .conversation_service
        .add_members(conversation_id, user_id, payload.user_ids)
        .await?;
    Ok(Json(added))
}

async fn leave_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<ConversationId>,
) -> Result<StatusCode, ApiError> {
    state
        .conversation_service
        .leave(conversation_id, user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn missed_notifications(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<MissedNotifications>, ApiError> {
    let missed = state.notification_aggregator.fetch_missed(user_id).await?;
    Ok(Json(missed))
}

async fn acknowledge_notifications(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<AcknowledgePayload>,
) -> Result<Json<CheckpointResponse>, ApiError> {
    let cursor = state
        .notification_aggregator
        .acknowledge(user_id, payload.cursor)
        .await?;
    Ok(Json(CheckpointResponse { cursor }))
}

async fn mark_all_read(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<CheckpointResponse>, ApiError> {
    let cursor = state.notification_aggregator.mark_all_read(user_id).await?;
    Ok(Json(CheckpointResponse { cursor }))
}

async fn ingest_social_event(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<SocialEventPayload>,
) -> (StatusCode, Json<SocialEventResponse>) {
    let recorded = state
        .notification_aggregator
        .dispatch(payload.into_event(user_id))
        .await
        .is_some();
    (StatusCode::ACCEPTED, Json(SocialEventResponse { recorded }))
}
