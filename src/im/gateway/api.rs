//! 消息网关 HTTP API 客户端
//!
//! 负责网关的一次性调用：投递、历史拉取、会话列表、已读上报、目录查询。

use crate::im::types::{handle_http_response, RemoteMessage, RemoteUser};
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

/// 目录搜索的单次返回上限
pub const SEARCH_RESULT_LIMIT: usize = 20;

/// 消息网关的 HTTP API 客户端
pub struct MessageApi {
    client: reqwest::Client,
    api_base_url: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct SendMsgData {
    #[serde(rename = "clientMsgID", default)]
    client_msg_id: String,
    #[serde(rename = "serverMsgID", default)]
    server_msg_id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryData {
    #[serde(default)]
    msgs: Vec<RemoteMessage>,
}

#[derive(Debug, Deserialize)]
struct PartnersData {
    #[serde(rename = "partnerIDs", default)]
    partner_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FindUserData {
    user: Option<RemoteUser>,
}

#[derive(Debug, Deserialize)]
struct SearchUsersData {
    #[serde(default)]
    users: Vec<RemoteUser>,
}

impl MessageApi {
    /// 创建新的 API 客户端
    ///
    /// `client` 应该已经在外部配置好认证拦截器（token 走 default_headers）
    pub fn new(client: reqwest::Client, api_base_url: String, user_id: String) -> Self {
        Self {
            client,
            api_base_url,
            user_id,
        }
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
        operation_name: &str,
    ) -> Result<reqwest::Response> {
        let operation_id = Uuid::new_v4().to_string();
        let url = format!("{}{}", self.api_base_url, path);
        debug!(
            "[MsgAPI] 📡 {}: {} (操作ID: {})",
            operation_name, url, operation_id
        );
        self.client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .json(&body)
            .send()
            .await
            .context("请求失败")
    }

    /// 投递一条消息，返回远端确认的消息 ID
    pub async fn send_message(&self, msg: &RemoteMessage) -> Result<String> {
        let response = self
            .post(
                "/msg/send_msg",
                serde_json::json!({ "message": msg }),
                "投递消息",
            )
            .await?;
        let resp = handle_http_response::<SendMsgData>(response, "投递消息").await?;
        let data = resp
            .data
            .ok_or_else(|| anyhow::anyhow!("投递响应缺少 data 字段"))?;
        debug!(
            "[MsgAPI] ✅ 投递成功 clientMsgID={} serverMsgID={}",
            data.client_msg_id, data.server_msg_id
        );
        // 远端以 clientMsgID 回执；serverMsgID 仅服务端内部使用
        Ok(if data.client_msg_id.is_empty() {
            msg.client_msg_id.clone()
        } else {
            data.client_msg_id
        })
    }

    /// 拉取某会话的一段历史消息
    pub async fn fetch_history(
        &self,
        owner_user_id: &str,
        partner_user_id: &str,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>> {
        let response = self
            .post(
                "/msg/pull_history",
                serde_json::json!({
                    "userID": owner_user_id,
                    "partnerID": partner_user_id,
                    "count": limit,
                }),
                "拉取历史",
            )
            .await?;
        let resp = handle_http_response::<HistoryData>(response, "拉取历史").await?;
        let msgs = resp.data.map(|d| d.msgs).unwrap_or_default();
        debug!(
            "[MsgAPI] 拉取历史 partner={} 共 {} 条",
            partner_user_id,
            msgs.len()
        );
        Ok(msgs)
    }

    /// 列出 owner 的全部会话对端
    pub async fn list_conversation_partners(&self, owner_user_id: &str) -> Result<Vec<String>> {
        let response = self
            .post(
                "/msg/conversation_partners",
                serde_json::json!({ "userID": owner_user_id }),
                "会话列表",
            )
            .await?;
        let resp = handle_http_response::<PartnersData>(response, "会话列表").await?;
        let ids = resp.data.map(|d| d.partner_ids).unwrap_or_default();
        info!("[MsgAPI] 会话对端共 {} 个", ids.len());
        Ok(ids)
    }

    /// 上报某会话已读
    pub async fn mark_seen(&self, owner_user_id: &str, partner_user_id: &str) -> Result<()> {
        let response = self
            .post(
                "/msg/mark_seen",
                serde_json::json!({
                    "userID": owner_user_id,
                    "partnerID": partner_user_id,
                }),
                "标记已读",
            )
            .await?;
        handle_http_response::<serde_json::Value>(response, "标记已读").await?;
        Ok(())
    }

    /// 目录查询单个用户
    pub async fn find_user(&self, user_id: &str) -> Result<Option<RemoteUser>> {
        let response = self
            .post(
                "/user/find",
                serde_json::json!({ "userID": user_id }),
                "查询用户",
            )
            .await?;
        let resp = handle_http_response::<FindUserData>(response, "查询用户").await?;
        Ok(resp.data.and_then(|d| d.user))
    }

    /// 目录搜索用户（服务端排除调用方自身并限量返回）
    pub async fn search_users(&self, keyword: &str) -> Result<Vec<RemoteUser>> {
        let response = self
            .post(
                "/user/search",
                serde_json::json!({
                    "userID": self.user_id,
                    "keyword": keyword,
                    "count": SEARCH_RESULT_LIMIT,
                }),
                "搜索用户",
            )
            .await?;
        let resp = handle_http_response::<SearchUsersData>(response, "搜索用户").await?;
        Ok(resp.data.map(|d| d.users).unwrap_or_default())
    }
}
