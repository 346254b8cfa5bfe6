//! 目录用户模块
//!
//! 本地缓存的用户快照，保证消息列表离线可渲染

pub mod dao;
pub mod models;

pub use dao::{UserCache, USER_CACHE_TTL_MS};
pub use models::LocalUser;
