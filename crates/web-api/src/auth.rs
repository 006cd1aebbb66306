//! JWT 认证
//!
//! 同一个 [`JwtService`] 既校验 WebSocket 握手里的 token（作为 [`TokenVerifier`]），
//! 也通过 [`AuthUser`] 提取器校验 REST 请求的 `Authorization: Bearer` 头。

use application::{AuthError, TokenVerifier};
use axum::{extract::FromRequestParts, http::request::Parts};
use config::JwtConfig;
use domain::UserId;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

#[derive(Clone)]
pub struct JwtService {
    expiration_hours: i64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            expiration_hours: config.expiration_hours,
            encoding_key: EncodingKey::from_secret(config.secret.as_ref()),
            decoding_key: DecodingKey::from_secret(config.secret.as_ref()),
        }
    }

    /// 签发 token，供 CRUD 侧和测试使用
    pub fn generate_token(&self, user_id: UserId) -> Result<String, ApiError> {
        let exp = chrono::Utc::now() + chrono::Duration::hours(self.expiration_hours);
        self.encode(&Claims {
            user_id: user_id.into(),
            exp: exp.timestamp(),
        })
    }

    pub fn encode(&self, claims: &Claims) -> Result<String, ApiError> {
        encode(&Header::default(), claims, &self.encoding_key).map_err(|err| {
            tracing::error!(error = %err, "签发 token 失败");
            ApiError::internal_server_error("token generation failed")
        })
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })
    }
}

impl TokenVerifier for JwtService {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        self.verify_token(token)
            .map(|claims| UserId::from(claims.user_id))
    }
}

/// 已认证的请求用户
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "))
            .ok_or(AuthError::InvalidToken)?;

        let user_id = state.jwt_service.verify(token.trim())?;
        Ok(AuthUser(user_id))
    }
}
