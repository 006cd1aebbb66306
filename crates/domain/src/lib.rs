//! 消息与通知系统核心领域模型
//!
//! 包含会话、成员关系、消息、通知等实体，以及消息生命周期和通知聚合的业务规则。

pub mod conversation;
pub mod errors;
pub mod events;
pub mod message;
pub mod notification;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::*;
pub use errors::*;
pub use events::*;
pub use message::*;
pub use notification::*;
pub use value_objects::*;
