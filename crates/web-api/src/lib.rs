//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 网关端点和配套的 REST 接口，请求都委托给应用层的用例服务。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{AuthUser, Claims, JwtService};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::{AppDependencies, AppState};
