//! 远端消息网关
//!
//! 引擎只通过 [`MessageGateway`] 接口访问远端：一次性的异步调用与
//! 推送订阅分别建模，互不混用。生产实现 [`HttpMessageGateway`] 由
//! HTTP API 客户端与 WebSocket 推送连接组合而成。

pub mod api;
pub mod http;
pub mod push;

pub use api::{MessageApi, SEARCH_RESULT_LIMIT};
pub use http::{GatewayConfig, HttpMessageGateway};
pub use push::{PushConfig, PushConnection};

use crate::im::types::{RemoteMessage, RemoteUser};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 远端消息网关接口
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// 投递一条消息，返回远端确认的消息 ID
    async fn send(&self, msg: &RemoteMessage) -> Result<String>;

    /// 订阅 (owner, partner) 会话的快照推送
    ///
    /// 远端对该会话路径上的任何变化都重推全量快照；接收端被丢弃后
    /// 订阅随之释放。
    async fn subscribe_chat(
        &self,
        owner_user_id: &str,
        partner_user_id: &str,
    ) -> Result<mpsc::Receiver<Vec<RemoteMessage>>>;

    /// 拉取一段历史消息（结果无序，调用方自行排序与截断）
    async fn fetch_history(
        &self,
        owner_user_id: &str,
        partner_user_id: &str,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>>;

    /// 列出 owner 的全部会话对端
    async fn list_conversation_partners(&self, owner_user_id: &str) -> Result<Vec<String>>;

    /// 把 (owner, partner) 会话中对端发来的消息标记为已读
    async fn mark_seen(&self, owner_user_id: &str, partner_user_id: &str) -> Result<()>;

    /// 目录查询单个用户
    async fn find_user(&self, user_id: &str) -> Result<Option<RemoteUser>>;

    /// 目录搜索用户
    ///
    /// 服务端按昵称/联系方式做大小写不敏感的子串匹配，排除调用方
    /// 自身并限量返回。
    async fn search_users(&self, keyword: &str) -> Result<Vec<RemoteUser>>;
}
