//! 消息网关 WebSocket 推送连接
//!
//! 维持与网关的长连接：鉴权、心跳、断线重连，并把收到的会话快照
//! 按对端分发给订阅者。连接状态通过 `watch<bool>` 对外广播，作为
//! 上层的连通性信号。

use crate::im::serialization::{compress_gzip, decompress_gzip, is_gzip};
use crate::im::types::{msg_type, ChatSnapshotPush, GatewayWsReq, GatewayWsResp, RemoteMessage, WsConnectResp};
use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// 心跳间隔
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// 断线后的重连间隔
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// 推送连接配置
#[derive(Clone, Debug)]
pub struct PushConfig {
    /// 用户 ID
    pub user_id: String,
    /// 认证 token
    pub token: String,
    /// WebSocket 服务器 URL
    pub ws_url: String,
    /// 压缩方式，例如 "gzip" 或空字符串表示不压缩
    pub compression: String,
}

/// 推送连接
pub struct PushConnection {
    config: PushConfig,
    writer: Arc<Mutex<Option<WsWriter>>>,
    /// 按对端分发的订阅者表
    subscribers: Arc<StdMutex<HashMap<String, Vec<mpsc::Sender<Vec<RemoteMessage>>>>>>,
    online_tx: watch::Sender<bool>,
}

impl PushConnection {
    pub fn new(config: PushConfig) -> Arc<Self> {
        let (online_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            writer: Arc::new(Mutex::new(None)),
            subscribers: Arc::new(StdMutex::new(HashMap::new())),
            online_tx,
        })
    }

    /// 连接状态信号（true = 在线）
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    fn set_online(&self, online: bool) {
        self.online_tx.send_replace(online);
    }

    /// 启动连接维护任务（连接、读循环、断线重连）
    pub fn spawn(self: Arc<Self>) {
        let conn = self;
        tokio::spawn(async move {
            loop {
                match conn.run_once().await {
                    Ok(()) => info!("[Push] 👋 连接关闭"),
                    Err(e) => warn!("[Push] 连接中断: {e}"),
                }
                conn.set_online(false);
                *conn.writer.lock().await = None;
                tokio::time::sleep(RECONNECT_INTERVAL).await;
                info!("[Push] 🔁 尝试重连");
            }
        });
    }

    /// 构建 WebSocket 连接 URL
    fn build_url(&self, operation_id: &str) -> String {
        let compression_param = if self.config.compression.is_empty() {
            String::new()
        } else {
            format!("&compression={}", self.config.compression)
        };
        format!(
            "{}/?token={}&sendID={}&operationID={}{}",
            self.config.ws_url, self.config.token, self.config.user_id, operation_id, compression_param
        )
    }

    /// 建立一次连接并运行读循环，直到连接断开
    async fn run_once(&self) -> Result<()> {
        let operation_id = format!("{}", chrono::Utc::now().timestamp_millis());
        let url = self.build_url(&operation_id);

        info!("[Push] 🔗 连接网关 (user={})", self.config.user_id);
        let (ws_stream, response) = connect_async(&url).await?;
        info!("[Push] ✅ WebSocket 连接成功, 状态: {}", response.status());

        let (write, mut read) = ws_stream.split();
        *self.writer.lock().await = Some(write);

        // 等待连接鉴权响应
        if let Some(Ok(WsMessage::Text(text))) = read.next().await {
            debug!("[Push] 📥 连接响应: {}", text);
            let resp: WsConnectResp =
                serde_json::from_str(&text).context("连接响应解析失败")?;
            if resp.err_code != 0 {
                let detail = if resp.err_dlt.is_empty() {
                    resp.err_msg.clone()
                } else {
                    format!("{} (详情: {})", resp.err_msg, resp.err_dlt)
                };
                anyhow::bail!("连接鉴权失败，错误码: {}, 错误信息: {}", resp.err_code, detail);
            }
            info!("[Push] ✅ 鉴权成功");
        } else {
            anyhow::bail!("未收到连接鉴权响应");
        }

        self.set_online(true);

        // 重连后补发当前订阅
        self.resend_subscriptions().await;

        // 心跳：掉线（online 翻 false）后自行退出
        let writer_for_heartbeat = self.writer.clone();
        let mut online_rx = self.connectivity();
        tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if !*online_rx.borrow_and_update() {
                    break;
                }
                let mut guard = writer_for_heartbeat.lock().await;
                match guard.as_mut() {
                    Some(w) => {
                        if w.send(WsMessage::Ping(vec![])).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });

        // 读循环
        while let Some(frame) = read.next().await {
            match frame {
                Ok(WsMessage::Binary(data)) => self.handle_binary_frame(data),
                Ok(WsMessage::Text(text)) => {
                    debug!("[Push] 文本帧: {}", text);
                }
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(frame)) => {
                    warn!("[Push] 👋 连接关闭: {:?}", frame);
                    break;
                }
                Err(e) => {
                    return Err(e).context("WebSocket 读取错误");
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// 订阅某会话的快照推送
    ///
    /// 返回的接收端被丢弃后，下一次分发时自动清理该订阅者。
    pub async fn subscribe(&self, partner_user_id: &str) -> mpsc::Receiver<Vec<RemoteMessage>> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers
            .lock()
            .unwrap()
            .entry(partner_user_id.to_string())
            .or_default()
            .push(tx);

        // 向网关登记订阅；失败只记录，重连后统一补发
        if let Err(e) = self
            .send_request(
                msg_type::WS_SUB_CHAT,
                serde_json::json!({ "partnerID": partner_user_id }),
            )
            .await
        {
            debug!("[Push] 订阅登记暂未送达（等待重连补发): {e}");
        }
        rx
    }

    /// 重连后重新登记所有仍有订阅者的会话
    async fn resend_subscriptions(&self) {
        let partners: Vec<String> = {
            let subs = self.subscribers.lock().unwrap();
            subs.keys().cloned().collect()
        };
        for partner in partners {
            if let Err(e) = self
                .send_request(
                    msg_type::WS_SUB_CHAT,
                    serde_json::json!({ "partnerID": partner }),
                )
                .await
            {
                warn!("[Push] 重连后补发订阅失败 partner={partner}: {e}");
            }
        }
    }

    /// 发送请求（JSON → 按配置 gzip → 二进制帧）
    async fn send_request(&self, req_identifier: i32, data: serde_json::Value) -> Result<()> {
        let operation_id = format!("{}", chrono::Utc::now().timestamp_millis());
        let req = GatewayWsReq {
            req_identifier,
            token: self.config.token.clone(),
            send_id: self.config.user_id.clone(),
            operation_id,
            data: serde_json::to_vec(&data)?,
        };
        let json = serde_json::to_vec(&req)?;
        let payload = if self.config.compression == "gzip" {
            compress_gzip(&json)?
        } else {
            json
        };

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| anyhow::anyhow!("未连接"))?;
        writer.send(WsMessage::Binary(payload)).await?;
        Ok(())
    }

    fn handle_binary_frame(&self, data: Vec<u8>) {
        let decompressed = if is_gzip(&data) {
            match decompress_gzip(&data) {
                Ok(d) => d,
                Err(e) => {
                    error!("[Push] 解压失败: {}", e);
                    return;
                }
            }
        } else {
            data
        };

        let resp = match serde_json::from_slice::<GatewayWsResp>(&decompressed) {
            Ok(r) => r,
            Err(e) => {
                error!(
                    "[Push] JSON 解析失败: {}, 原始数据: {:?}",
                    e,
                    String::from_utf8_lossy(&decompressed)
                );
                return;
            }
        };

        match resp.req_identifier {
            msg_type::WS_PUSH_MSG => {
                if resp.data.is_empty() {
                    return;
                }
                match serde_json::from_slice::<ChatSnapshotPush>(&resp.data) {
                    Ok(push) => self.dispatch_snapshot(push),
                    Err(e) => error!("[Push] 快照解析失败: {}", e),
                }
            }
            msg_type::WS_KICK_ONLINE_MSG => {
                warn!("[Push] ⚠️ 被踢下线");
            }
            _ => {
                debug!("[Push] 未知消息类型: {}", resp.req_identifier);
            }
        }
    }

    /// 把会话快照分发给该对端的所有订阅者，顺带清理已取消的订阅
    fn dispatch_snapshot(&self, push: ChatSnapshotPush) {
        let mut subs = self.subscribers.lock().unwrap();
        let Some(senders) = subs.get_mut(&push.partner_id) else {
            debug!("[Push] 无人订阅的会话快照: {}", push.partner_id);
            return;
        };
        senders.retain(|tx| {
            match tx.try_send(push.msgs.clone()) {
                Ok(()) => true,
                // 消费过慢丢当前帧，订阅保留；下一帧是全量快照，不丢数据
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        if senders.is_empty() {
            subs.remove(&push.partner_id);
        }
    }
}
