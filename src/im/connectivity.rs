//! 网络连通性信号
//!
//! 连通性是一个只读广播的 `watch<bool>`；监视器只对"离线 → 在线"
//! 的上升沿做出反应，触发一轮待发送消息补发。

use crate::im::message::service::SyncEngine;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// 连通性监视器
pub struct ConnectivityMonitor;

impl ConnectivityMonitor {
    /// 启动监视任务
    ///
    /// 每次上升沿都会另起任务补发，补发任务无取消令牌，调用方停止
    /// 观察后在途的补发仍会静默完成。
    pub fn spawn(
        engine: Arc<SyncEngine>,
        owner_user_id: String,
        mut rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut online = *rx.borrow();
            loop {
                if rx.changed().await.is_err() {
                    // 信号源关闭，监视结束
                    break;
                }
                let now_online = *rx.borrow();
                if now_online == online {
                    continue;
                }
                online = now_online;

                let listener = engine.listener();
                if now_online {
                    info!("[Connectivity] 网络恢复，触发待发送消息补发");
                    listener
                        .on_connection_status_changed(true, "网络已恢复".to_string())
                        .await;
                    let engine = engine.clone();
                    let owner = owner_user_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.sync_pending_messages(&owner).await {
                            error!("[Connectivity] 补发待发送消息失败: {e}");
                        }
                    });
                } else {
                    info!("[Connectivity] 网络断开");
                    listener
                        .on_connection_status_changed(false, "网络已断开".to_string())
                        .await;
                }
            }
        })
    }
}
