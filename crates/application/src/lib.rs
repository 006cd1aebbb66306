//! 应用层实现。
//!
//! 围绕领域模型的用例服务：消息生命周期、通知聚合、会话管理、
//! 以及连接网关和会话复用器。外部依赖（存储、限流、在线状态、广播）都以 trait 抽象。

pub mod clock;
pub mod collaborators;
pub mod dto;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod lifecycle;
pub mod memory;
pub mod notifications;
pub mod pool;
pub mod presence;
pub mod protocol;
pub mod rate_limiter;
pub mod repository;
pub mod services;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    ContentDirectory, FollowGraph, ObjectStorage, TokenVerifier, UserDirectory, UserProfile,
};
pub use error::{ApplicationError, AuthError, ErrorCode, ErrorKind};
pub use fanout::{
    DeliveryOutcome, FanoutBus, FanoutError, FanoutEvent, GroupName, LocalFanoutBus, SessionId,
    SessionSink, SubscriptionHandle, SubscriptionRegistry,
};
pub use gateway::{ConnectionGateway, GatewayDependencies};
pub use lifecycle::{
    MessageLifecycleDependencies, MessageLifecycleManager, MessagePolicy, NewMessage,
};
pub use notifications::NotificationAggregator;
pub use pool::PersistencePool;
pub use presence::{MemoryPresenceTracker, PresenceTracker, RedisPresenceTracker};
pub use rate_limiter::{MemoryRateLimiter, RateDecision, RateLimiter, RedisRateLimiter};
pub use repository::{
    ConversationRepository, MembershipRepository, MessageRepository, NotificationRepository,
    ReadReceiptRepository,
};
pub use services::{
    ConversationService, ConversationServiceDependencies, UploadService,
    CONVERSATION_DEACTIVATED_EVENT,
};
pub use session::{SessionMultiplexer, SessionServices};
