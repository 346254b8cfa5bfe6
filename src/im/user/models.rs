//! 目录用户本地模型定义

use crate::im::types::RemoteUser;
use serde::{Deserialize, Serialize};

/// 本地缓存的目录用户快照
///
/// 任何一次成功的目录查询都会覆盖写入，`cached_at` 记录写入时刻，
/// 超过保鲜期的行可被清理。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(rename = "phoneNumber", default)]
    pub phone_number: String,
    #[serde(rename = "faceURL", default)]
    pub face_url: String,
    #[serde(rename = "cachedAt")]
    pub cached_at: i64,
}

impl LocalUser {
    /// 由目录查询结果构建缓存行
    pub fn from_remote(user: &RemoteUser, cached_at: i64) -> Self {
        Self {
            user_id: user.user_id.clone(),
            nickname: user.nickname.clone(),
            phone_number: user.phone_number.clone(),
            face_url: user.face_url.clone(),
            cached_at,
        }
    }
}
