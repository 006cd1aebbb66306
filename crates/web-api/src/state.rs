use std::sync::Arc;
use std::time::Duration;

use application::{
    Clock, ConnectionGateway, ContentDirectory, ConversationRepository, ConversationService,
    ConversationServiceDependencies, FanoutBus, FollowGraph, GatewayDependencies,
    MembershipRepository, MessageLifecycleDependencies, MessageLifecycleManager, MessagePolicy,
    MessageRepository, NotificationAggregator, NotificationRepository, ObjectStorage,
    PersistencePool, PresenceTracker, RateLimiter, ReadReceiptRepository, SessionServices,
    UploadService, UserDirectory,
};
use config::AppConfig;

use crate::JwtService;

/// 组装服务所需的全部适配器，Postgres/Redis 与内存实现都从这里接入
pub struct AppDependencies {
    pub conversation_repository: Arc<dyn ConversationRepository>,
    pub membership_repository: Arc<dyn MembershipRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub receipt_repository: Arc<dyn ReadReceiptRepository>,
    pub notification_repository: Arc<dyn NotificationRepository>,
    pub user_directory: Arc<dyn UserDirectory>,
    pub follow_graph: Arc<dyn FollowGraph>,
    pub content_directory: Arc<dyn ContentDirectory>,
    pub object_storage: Arc<dyn ObjectStorage>,
    pub fanout: Arc<dyn FanoutBus>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub presence: Arc<dyn PresenceTracker>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ConnectionGateway>,
    pub conversation_service: Arc<ConversationService>,
    pub notification_aggregator: Arc<NotificationAggregator>,
    pub upload_service: Arc<UploadService>,
    pub jwt_service: Arc<JwtService>,
    pub handshake_timeout: Duration,
    pub max_upload_bytes: u64,
}

impl AppState {
    pub fn build(deps: AppDependencies, config: &AppConfig) -> Self {
        let jwt_service = Arc::new(JwtService::new(&config.jwt));

        let lifecycle = MessageLifecycleManager::new(
            MessageLifecycleDependencies {
                conversation_repository: deps.conversation_repository.clone(),
                membership_repository: deps.membership_repository.clone(),
                message_repository: deps.message_repository.clone(),
                receipt_repository: deps.receipt_repository,
                follow_graph: deps.follow_graph,
                content_directory: deps.content_directory,
                clock: deps.clock.clone(),
            },
            MessagePolicy::from_config(&config.chat),
        );

        let services = Arc::new(SessionServices {
            lifecycle: Arc::new(lifecycle),
            rate_limiter: deps.rate_limiter,
            presence: deps.presence.clone(),
            bus: deps.fanout.clone(),
            pool: PersistencePool::from_config(&config.server),
            send_rate_max: config.chat.send_rate_max,
            send_rate_window: Duration::from_secs(config.chat.send_rate_window_secs),
        });

        let gateway = ConnectionGateway::new(GatewayDependencies {
            token_verifier: jwt_service.clone(),
            user_directory: deps.user_directory.clone(),
            services,
            clock: deps.clock.clone(),
            outbound_queue: config.server.outbound_queue,
        });

        let conversation_service = ConversationService::new(
            ConversationServiceDependencies {
                conversation_repository: deps.conversation_repository,
                membership_repository: deps.membership_repository,
                message_repository: deps.message_repository,
                user_directory: deps.user_directory,
                presence: deps.presence,
                bus: deps.fanout.clone(),
                clock: deps.clock.clone(),
            },
            config.chat.history_page_size,
        );

        let notification_aggregator = NotificationAggregator::new(
            deps.notification_repository,
            deps.fanout,
            deps.clock,
            &config.notifications,
        );

        Self {
            gateway: Arc::new(gateway),
            conversation_service: Arc::new(conversation_service),
            notification_aggregator: Arc::new(notification_aggregator),
            upload_service: Arc::new(UploadService::new(deps.object_storage, &config.storage)),
            jwt_service,
            handshake_timeout: config.server.handshake_timeout(),
            max_upload_bytes: config.storage.max_upload_bytes,
        }
    }
}
