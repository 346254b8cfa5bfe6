//! 消息模块
//!
//! 本地消息缓存与同步引擎

pub mod dao;
pub mod listener;
pub mod models;
pub mod service;

// 重新导出主要类型和函数
pub use dao::MessageCache;
pub use listener::{EmptyMessageListener, MessageListener};
pub use models::{ChatPreview, LocalMessage, MessageStatus};
pub use service::{SyncEngine, SyncEngineConfig, DEFAULT_HISTORY_WINDOW};
