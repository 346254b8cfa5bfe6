//! 生产网关实现：HTTP API + WebSocket 推送
//!
//! 一次性调用走 [`MessageApi`]，快照订阅走 [`PushConnection`]；
//! 推送连接的在线状态就是上层的连通性信号。

use crate::im::gateway::api::MessageApi;
use crate::im::gateway::push::{PushConfig, PushConnection};
use crate::im::gateway::MessageGateway;
use crate::im::types::{RemoteMessage, RemoteUser};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// 网关连接配置
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub user_id: String,
    pub token: String,
    pub api_base_url: String,
    pub ws_url: String,
    pub compression: String,
}

/// 生产环境的消息网关
pub struct HttpMessageGateway {
    user_id: String,
    api: MessageApi,
    push: Arc<PushConnection>,
}

impl HttpMessageGateway {
    /// 构建网关并启动推送连接的维护任务
    pub fn connect(config: GatewayConfig) -> Result<Self> {
        // 认证 token 通过 default_headers 自动附加到每个请求
        let http_client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::HeaderName::from_static("token"),
                    reqwest::header::HeaderValue::from_str(&config.token)
                        .context("无效的 token")?,
                );
                headers
            })
            .build()
            .context("创建 HTTP 客户端失败")?;

        let api = MessageApi::new(
            http_client,
            config.api_base_url.clone(),
            config.user_id.clone(),
        );
        let push = PushConnection::new(PushConfig {
            user_id: config.user_id.clone(),
            token: config.token.clone(),
            ws_url: config.ws_url.clone(),
            compression: config.compression.clone(),
        });
        push.clone().spawn();

        Ok(Self {
            user_id: config.user_id,
            api,
            push,
        })
    }

    /// 连接状态信号（true = 在线）
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.push.connectivity()
    }
}

#[async_trait]
impl MessageGateway for HttpMessageGateway {
    async fn send(&self, msg: &RemoteMessage) -> Result<String> {
        self.api.send_message(msg).await
    }

    async fn subscribe_chat(
        &self,
        owner_user_id: &str,
        partner_user_id: &str,
    ) -> Result<mpsc::Receiver<Vec<RemoteMessage>>> {
        // 推送连接绑定登录用户，owner 参数仅做一致性校验
        if owner_user_id != self.user_id {
            warn!(
                "[Gateway] 订阅 owner 与连接登录用户不一致: {} != {}",
                owner_user_id, self.user_id
            );
        }
        Ok(self.push.subscribe(partner_user_id).await)
    }

    async fn fetch_history(
        &self,
        owner_user_id: &str,
        partner_user_id: &str,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>> {
        self.api
            .fetch_history(owner_user_id, partner_user_id, limit)
            .await
    }

    async fn list_conversation_partners(&self, owner_user_id: &str) -> Result<Vec<String>> {
        self.api.list_conversation_partners(owner_user_id).await
    }

    async fn mark_seen(&self, owner_user_id: &str, partner_user_id: &str) -> Result<()> {
        self.api.mark_seen(owner_user_id, partner_user_id).await
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<RemoteUser>> {
        self.api.find_user(user_id).await
    }

    async fn search_users(&self, keyword: &str) -> Result<Vec<RemoteUser>> {
        self.api.search_users(keyword).await
    }
}
