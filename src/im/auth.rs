use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "areaCode")]
    pub area_code: String,
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    pub password: String,
    pub platform: i32,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    pub data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
pub struct LoginData {
    #[serde(rename = "imToken")]
    pub im_token: String,
    #[serde(rename = "userID")]
    pub user_id: String,
}

/// 账号登录，成功后返回 IM token 和 userID
pub async fn login_async(
    auth_base_url: &str,
    area_code: String,
    phone_number: String,
    password: String,
    platform: i32,
) -> Result<LoginResponse, String> {
    use uuid::Uuid;

    let client = reqwest::Client::new();
    let operation_id = Uuid::new_v4().to_string();

    let login_req = LoginRequest {
        area_code,
        phone_number,
        password,
        platform,
    };

    let url = format!("{}/account/login", auth_base_url);

    info!("🔐 正在登录...");
    debug!("   URL: {}", url);
    debug!("   手机号: {}", login_req.phone_number);
    debug!("   OperationID: {}", operation_id);

    let response = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("operationID", &operation_id)
        .json(&login_req)
        .send()
        .await
        .map_err(|e| format!("请求失败: {}", e))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| format!("读取响应失败: {}", e))?;

    if !status.is_success() {
        return Err(format!("HTTP 错误 {}: {}", status, text));
    }

    debug!("✅ 登录响应: {}", text);

    let login_resp: LoginResponse = serde_json::from_str(&text)
        .map_err(|e| format!("解析响应失败: {}，原始响应: {}", e, text))?;

    Ok(login_resp)
}

/// 当前登录身份
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user_id: String,
    pub token: String,
}

/// 登录会话持有者
///
/// owner 身份的唯一来源：引擎的鉴权检查与登出清理都以此为准。
#[derive(Default)]
pub struct AuthSession {
    inner: RwLock<Option<SessionInfo>>,
}

impl AuthSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录登录身份（覆盖旧会话）
    pub fn sign_in(&self, user_id: String, token: String) {
        let mut guard = self.inner.write().unwrap();
        *guard = Some(SessionInfo { user_id, token });
    }

    /// 清除登录身份，返回被清除的会话（用于登出时定位要清理的账号）
    pub fn sign_out(&self) -> Option<SessionInfo> {
        self.inner.write().unwrap().take()
    }

    pub fn current(&self) -> Option<SessionInfo> {
        self.inner.read().unwrap().clone()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.inner.read().unwrap().as_ref().map(|s| s.user_id.clone())
    }

    /// 给定的 user_id 是否就是当前登录身份
    pub fn is_current(&self, user_id: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|s| s.user_id == user_id)
    }
}
