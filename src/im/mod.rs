//! IM 客户端核心
//!
//! 本地缓存 + 远端网关的离线优先消息同步

pub mod auth;
pub mod client;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod gateway;
pub mod message;
pub mod serialization;
pub mod types;
pub mod user;

// 重新导出认证相关函数
pub use auth::{login_async, AuthSession};
