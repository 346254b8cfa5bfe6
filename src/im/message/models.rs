//! 消息本地模型定义

use crate::im::types::RemoteMessage;
use crate::im::user::models::LocalUser;
use serde::{Deserialize, Serialize};

/// 消息投递状态
///
/// 生命周期有序：`Pending → Sent → Delivered → Seen`，合并只允许前移。
/// 唯一的回退路径是发送失败时由引擎显式把 `Sent` 回退为 `Pending`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageStatus {
    /// 本地已接受，远端尚未确认
    Pending = 1,
    /// 远端已确认接收
    Sent = 2,
    /// 对端已送达
    Delivered = 3,
    /// 对端已读
    Seen = 4,
}

impl MessageStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// 未知状态码一律按 Pending 处理，异常推送不会把状态推前
    pub fn from_i32(v: i32) -> Self {
        match v {
            2 => MessageStatus::Sent,
            3 => MessageStatus::Delivered,
            4 => MessageStatus::Seen,
            _ => MessageStatus::Pending,
        }
    }
}

/// 本地消息结构体
///
/// `owner_user_id` 是写入该行的登录账号，同一设备多账号的数据按它隔离；
/// `partner_user_id` 是会话对端，作为缓存的分组键。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMessage {
    #[serde(rename = "clientMsgID")]
    pub client_msg_id: String,
    #[serde(rename = "ownerUserID")]
    pub owner_user_id: String,
    #[serde(rename = "partnerUserID")]
    pub partner_user_id: String,
    #[serde(rename = "sendID")]
    pub send_id: String,
    #[serde(rename = "recvID")]
    pub recv_id: String,
    pub content: String,
    #[serde(rename = "sendTime")]
    pub send_time: i64,
    pub status: MessageStatus,
    #[serde(rename = "isSelf")]
    pub is_self: bool,
}

impl LocalMessage {
    /// 由远端消息换算本地行：partner 取对端，is_self 由发送者判定
    pub fn from_remote(owner_user_id: &str, msg: &RemoteMessage) -> Self {
        let is_self = msg.send_id == owner_user_id;
        let partner_user_id = if is_self {
            msg.recv_id.clone()
        } else {
            msg.send_id.clone()
        };
        Self {
            client_msg_id: msg.client_msg_id.clone(),
            owner_user_id: owner_user_id.to_string(),
            partner_user_id,
            send_id: msg.send_id.clone(),
            recv_id: msg.recv_id.clone(),
            content: msg.content.clone(),
            send_time: msg.send_time,
            status: MessageStatus::from_i32(msg.status),
            is_self,
        }
    }

    /// 转为网关线上格式（剥离本地派生字段）
    pub fn to_remote(&self) -> RemoteMessage {
        RemoteMessage {
            client_msg_id: self.client_msg_id.clone(),
            send_id: self.send_id.clone(),
            recv_id: self.recv_id.clone(),
            content: self.content.clone(),
            send_time: self.send_time,
            status: self.status.as_i32(),
        }
    }
}

/// 会话预览（派生视图，不落库，随缓存变化重算）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatPreview {
    #[serde(rename = "partnerUserID")]
    pub partner_user_id: String,
    /// 对端用户快照（目录缓存未命中且远端不可达时为 None）
    pub user: Option<LocalUser>,
    #[serde(rename = "latestMsg")]
    pub latest_msg: String,
    #[serde(rename = "latestMsgSendTime")]
    pub latest_msg_send_time: i64,
    #[serde(rename = "unreadCount")]
    pub unread_count: i64,
}
