//! 同步引擎事件监听器

use async_trait::async_trait;

/// 同步引擎事件回调接口（可由调用方注册）
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// 连接状态变化
    async fn on_connection_status_changed(&self, connected: bool, message: String);

    /// 全量会话同步开始
    async fn on_sync_server_start(&self);

    /// 全量会话同步完成
    async fn on_sync_server_finish(&self);

    /// 全量会话同步失败
    async fn on_sync_server_failed(&self, reason: String);

    /// 待发送消息重试完成，参数为本轮成功补发的条数
    async fn on_pending_messages_retried(&self, retried: usize);
}

/// 空实现（默认监听器）
pub struct EmptyMessageListener;

#[async_trait]
impl MessageListener for EmptyMessageListener {
    async fn on_connection_status_changed(&self, _connected: bool, _message: String) {}
    async fn on_sync_server_start(&self) {}
    async fn on_sync_server_finish(&self) {}
    async fn on_sync_server_failed(&self, _reason: String) {}
    async fn on_pending_messages_retried(&self, _retried: usize) {}
}
