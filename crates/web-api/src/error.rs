use application::{ApplicationError, AuthError, ErrorCode, ErrorKind};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::ValidationError.as_str(),
            message,
        )
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ServerError.as_str(),
            message,
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.body.code
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidToken | ErrorCode::TokenExpired => StatusCode::UNAUTHORIZED,
        ErrorCode::UserNotFound
        | ErrorCode::ConversationNotFound
        | ErrorCode::MessageNotFound
        | ErrorCode::PostNotFound => StatusCode::NOT_FOUND,
        ErrorCode::NotMember
        | ErrorCode::Unauthorized
        | ErrorCode::NoFollowRelationship
        | ErrorCode::EditTimeExpired
        | ErrorCode::DeleteTimeExpired => StatusCode::FORBIDDEN,
        ErrorCode::ValidationError | ErrorCode::InvalidAction => StatusCode::BAD_REQUEST,
        ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::InvalidFileType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorCode::ServerError | ErrorCode::FileUploadFailed => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        let code = error.code();
        if error.kind() == ErrorKind::Server {
            tracing::error!(error = %error, code = code.as_str(), "请求处理失败");
        } else {
            tracing::debug!(error = %error, code = code.as_str(), "请求被拒绝");
        }
        ApiError::new(status_for(code), code.as_str(), error.public_message())
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        ApplicationError::from(error).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
