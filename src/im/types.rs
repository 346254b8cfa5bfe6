use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// WebSocket 消息类型标识符
pub mod msg_type {
    pub const WS_SUB_CHAT: i32 = 1001;
    pub const WS_SEND_MSG: i32 = 1003;
    pub const WS_PUSH_MSG: i32 = 2001;
    pub const WS_KICK_ONLINE_MSG: i32 = 2002;
}

/// 远端消息结构（网关线上格式）
///
/// 不携带 owner / partner / isSelf 字段，这三者由本地根据登录身份换算。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    #[serde(rename = "clientMsgID")]
    pub client_msg_id: String,
    #[serde(rename = "sendID")]
    pub send_id: String,
    #[serde(rename = "recvID")]
    pub recv_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "sendTime", default)]
    pub send_time: i64,
    #[serde(default)]
    pub status: i32,
}

/// 目录用户结构（网关线上格式）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUser {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(rename = "phoneNumber", default)]
    pub phone_number: String,
    #[serde(rename = "faceURL", default)]
    pub face_url: String,
}

/// WebSocket 请求结构
#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayWsReq {
    #[serde(rename = "reqIdentifier")]
    pub req_identifier: i32,
    pub token: String,
    #[serde(rename = "sendID")]
    pub send_id: String,
    #[serde(rename = "operationID")]
    pub operation_id: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// WebSocket 响应结构（用于二进制消息）
#[derive(Debug, Deserialize, Serialize)]
pub struct GatewayWsResp {
    #[serde(rename = "reqIdentifier")]
    pub req_identifier: i32,
    #[serde(rename = "operationID", default)]
    pub operation_id: String,
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    #[serde(
        default,
        deserialize_with = "crate::im::serialization::deserialize_base64"
    )]
    pub data: Vec<u8>,
}

/// WebSocket 连接响应结构（文本消息）
#[derive(Debug, Deserialize)]
pub struct WsConnectResp {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    #[serde(rename = "errDlt", default)]
    pub err_dlt: String,
    /// data 字段可能为 null、缺失或包含实际数据
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// 会话快照推送（WS_PUSH_MSG 的 data 内容）
///
/// 远端对一条会话路径上的任何变化都会重推该会话的全量快照。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatSnapshotPush {
    #[serde(rename = "partnerID")]
    pub partner_id: String,
    #[serde(default)]
    pub msgs: Vec<RemoteMessage>,
}

/// 统一的 API 响应包装结构体（包含 errCode、errMsg、data）
/// data 字段可能为 null 或缺失，因此使用 Option<T>
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    pub data: Option<T>,
}

/// 通用 HTTP 响应处理函数：直接反序列化为统一的响应结构体
///
/// 返回 `ApiResponse<T>`，调用方根据需要处理 `data` 字段（可能为 None）。
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> anyhow::Result<ApiResponse<T>> {
    use anyhow::Context;

    let status = response.status();

    // body 只能读取一次，先取 bytes 再按需反序列化
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, body_str));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    let api_resp: ApiResponse<T> = serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}，原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })?;

    if api_resp.err_code != 0 {
        error!(
            "[HTTP] {}服务器错误，错误码: {}, 错误信息: {}",
            operation_name, api_resp.err_code, api_resp.err_msg
        );
        return Err(anyhow::anyhow!(
            "服务器错误 {}: {}",
            api_resp.err_code,
            api_resp.err_msg
        ));
    }

    Ok(api_resp)
}
