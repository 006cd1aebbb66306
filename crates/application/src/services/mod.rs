mod conversation_service;
mod upload_service;

pub use conversation_service::{
    ConversationService, ConversationServiceDependencies, CONVERSATION_DEACTIVATED_EVENT,
};
pub use upload_service::UploadService;
