//! 消息同步服务层
//!
//! 引擎负责本地缓存与远端网关之间的对账：乐观本地写入、后台补发、
//! 本地/远端双流合并，以及按登录账号隔离的缓存清理。
//! 所有变更都经由缓存自身的原子写入完成，引擎不持有额外的互斥锁。

use crate::im::auth::AuthSession;
use crate::im::error::SyncError;
use crate::im::gateway::MessageGateway;
use crate::im::message::dao::MessageCache;
use crate::im::message::listener::{EmptyMessageListener, MessageListener};
use crate::im::message::models::{ChatPreview, LocalMessage, MessageStatus};
use crate::im::serialization::generate_msg_id;
use crate::im::types::RemoteMessage;
use crate::im::user::dao::{UserCache, USER_CACHE_TTL_MS};
use crate::im::user::models::LocalUser;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 每个会话默认的历史拉取窗口
pub const DEFAULT_HISTORY_WINDOW: usize = 50;

/// 同步引擎配置
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// 全量同步时每个会话拉取的历史消息条数上限
    pub history_window: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

/// 消息同步引擎
///
/// 本地缓存是唯一共享可变资源，引擎是它唯一的写入方；UI 只消费派生流。
#[derive(Clone)]
pub struct SyncEngine {
    config: SyncEngineConfig,
    cache: Arc<MessageCache>,
    users: Arc<UserCache>,
    gateway: Arc<dyn MessageGateway>,
    session: Arc<AuthSession>,
    listener: Arc<dyn MessageListener>,
}

impl SyncEngine {
    /// 创建新的同步引擎（使用默认空监听器）
    pub fn new(
        config: SyncEngineConfig,
        cache: Arc<MessageCache>,
        users: Arc<UserCache>,
        gateway: Arc<dyn MessageGateway>,
        session: Arc<AuthSession>,
    ) -> Self {
        Self::with_listener(
            config,
            cache,
            users,
            gateway,
            session,
            Arc::new(EmptyMessageListener),
        )
    }

    /// 创建新的同步引擎（带自定义监听器）
    pub fn with_listener(
        config: SyncEngineConfig,
        cache: Arc<MessageCache>,
        users: Arc<UserCache>,
        gateway: Arc<dyn MessageGateway>,
        session: Arc<AuthSession>,
        listener: Arc<dyn MessageListener>,
    ) -> Self {
        Self {
            config,
            cache,
            users,
            gateway,
            session,
            listener,
        }
    }

    pub fn listener(&self) -> Arc<dyn MessageListener> {
        self.listener.clone()
    }

    /// 发送一条文本消息
    ///
    /// 本地落库先于任何网络动作，落库失败则整个调用失败；
    /// 离线时消息以 PENDING 留在缓存等待补发，不触达网关；
    /// 在线投递失败时状态回退为 PENDING 并返回投递错误。
    /// 文本内容不做裁剪与空值校验，空文本原样透传。
    pub async fn send_message(
        &self,
        owner_user_id: &str,
        recv_id: &str,
        text: &str,
        online: bool,
    ) -> Result<LocalMessage, SyncError> {
        if !self.session.is_current(owner_user_id) {
            return Err(SyncError::NotAuthenticated);
        }

        let mut msg = LocalMessage {
            client_msg_id: generate_msg_id(owner_user_id),
            owner_user_id: owner_user_id.to_string(),
            partner_user_id: recv_id.to_string(),
            send_id: owner_user_id.to_string(),
            recv_id: recv_id.to_string(),
            content: text.to_string(),
            send_time: chrono::Utc::now().timestamp_millis(),
            status: if online {
                MessageStatus::Sent
            } else {
                MessageStatus::Pending
            },
            is_self: true,
        };

        self.cache
            .upsert_message(&msg)
            .await
            .map_err(SyncError::LocalPersistence)?;

        if !online {
            debug!(
                "[SyncEngine] 离线发送，消息留存为 PENDING: {}",
                msg.client_msg_id
            );
            return Ok(msg);
        }

        let mut payload = msg.to_remote();
        payload.status = MessageStatus::Sent.as_i32();
        match self.gateway.send(&payload).await {
            Ok(_ack_id) => {
                // 行在落库时已是 SENT，这里的确认写失败不影响投递结果
                if let Err(e) = self
                    .cache
                    .update_status(&msg.client_msg_id, owner_user_id, MessageStatus::Sent)
                    .await
                {
                    warn!("[SyncEngine] 投递确认后的状态写入失败: {e}");
                }
                msg.status = MessageStatus::Sent;
                Ok(msg)
            }
            Err(e) => {
                if let Err(rollback_err) = self
                    .cache
                    .update_status(&msg.client_msg_id, owner_user_id, MessageStatus::Pending)
                    .await
                {
                    warn!("[SyncEngine] 投递失败后的状态回退失败: {rollback_err}");
                }
                Err(SyncError::RemoteDelivery(e))
            }
        }
    }

    /// 补发 owner 名下所有 PENDING 消息
    ///
    /// 按行内记录的 send_id 补发（换号前写入的行保持原作者）；单条失败
    /// 不中断后续补发，只有待发送集合本身读不出来才算调用失败。
    /// 返回本轮成功补发的条数；重复调用是幂等的。
    pub async fn sync_pending_messages(&self, owner_user_id: &str) -> Result<usize, SyncError> {
        let pending = self
            .cache
            .pending_messages(owner_user_id)
            .await
            .map_err(SyncError::LocalPersistence)?;
        if pending.is_empty() {
            return Ok(0);
        }

        info!("[SyncEngine] 开始补发待发送消息，共 {} 条", pending.len());
        let mut retried = 0usize;
        for row in &pending {
            let mut payload = row.to_remote();
            payload.status = MessageStatus::Sent.as_i32();
            match self.gateway.send(&payload).await {
                Ok(_) => {
                    match self
                        .cache
                        .update_status(&row.client_msg_id, owner_user_id, MessageStatus::Sent)
                        .await
                    {
                        Ok(_) => retried += 1,
                        Err(e) => warn!(
                            "[SyncEngine] 补发成功但状态更新失败: {} {e}",
                            row.client_msg_id
                        ),
                    }
                }
                Err(e) => {
                    warn!(
                        "[SyncEngine] 补发失败，保持 PENDING: {} {e}",
                        row.client_msg_id
                    );
                }
            }
        }
        info!("[SyncEngine] 补发完成，成功 {}/{}", retried, pending.len());
        self.listener.on_pending_messages_retried(retried).await;
        Ok(retried)
    }

    /// 订阅某会话的消息列表（活跃流）
    ///
    /// 首帧立即给出本地快照；之后在缓存变更信号与远端快照推送上做
    /// combine-latest，远端快照经 [`Self::merge_chat_snapshot`] 合并后发出。
    /// 连续重复帧按列表值相等抑制。消费端丢弃接收端即取消整条流。
    pub async fn watch_chat(
        &self,
        owner_user_id: &str,
        partner_user_id: &str,
    ) -> mpsc::Receiver<Vec<LocalMessage>> {
        let (tx, rx) = mpsc::channel(32);

        let initial = match self
            .cache
            .messages_for_chat(partner_user_id, owner_user_id)
            .await
        {
            Ok(list) => list,
            Err(e) => {
                warn!("[SyncEngine] 读取本地会话快照失败: {e}");
                Vec::new()
            }
        };
        let _ = tx.send(initial.clone()).await;

        let engine = self.clone();
        let owner = owner_user_id.to_string();
        let partner = partner_user_id.to_string();
        tokio::spawn(async move {
            let mut changes = engine.cache.subscribe_changes();
            let mut _remote_keepalive: Option<mpsc::Sender<Vec<RemoteMessage>>> = None;
            // 远端订阅失败按"无远端数据"降级，流不终止
            let mut remote_rx = match engine.gateway.subscribe_chat(&owner, &partner).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("[SyncEngine] 远端订阅失败，降级为本地数据: {e}");
                    idle_remote(&mut _remote_keepalive)
                }
            };

            let mut latest_remote: Vec<RemoteMessage> = Vec::new();
            let mut last_emitted = Some(initial);
            loop {
                tokio::select! {
                    changed = changes.recv() => {
                        match changed {
                            Ok(()) | Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => break,
                        }
                    }
                    pushed = remote_rx.recv() => {
                        match pushed {
                            Some(list) => latest_remote = list,
                            None => {
                                // 远端流断开：换成永不产出的占位接收端，继续跟随本地
                                remote_rx = idle_remote(&mut _remote_keepalive);
                                continue;
                            }
                        }
                    }
                    _ = tx.closed() => break,
                }

                let merged = match engine
                    .merge_chat_snapshot(&owner, &partner, &latest_remote)
                    .await
                {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("[SyncEngine] 合并会话快照失败: {e}");
                        continue;
                    }
                };
                if last_emitted.as_ref() != Some(&merged) {
                    if tx.send(merged.clone()).await.is_err() {
                        break;
                    }
                    last_emitted = Some(merged);
                }
            }
            debug!("[SyncEngine] 会话订阅结束: owner={owner} partner={partner}");
        });
        rx
    }

    /// 合并远端快照到本地列表
    ///
    /// 远端空快照视为离线/无数据，本地列表原样返回；
    /// 本地未知的 ID 写穿入库；已知 ID 只允许状态前移，绝不回退。
    /// 结果按发送时间升序。
    pub(crate) async fn merge_chat_snapshot(
        &self,
        owner_user_id: &str,
        partner_user_id: &str,
        remote: &[RemoteMessage],
    ) -> Result<Vec<LocalMessage>> {
        let mut local = self
            .cache
            .messages_for_chat(partner_user_id, owner_user_id)
            .await?;
        if remote.is_empty() {
            return Ok(local);
        }

        for rm in remote {
            if let Some(existing) = local
                .iter_mut()
                .find(|m| m.client_msg_id == rm.client_msg_id)
            {
                let remote_status = MessageStatus::from_i32(rm.status);
                if remote_status > existing.status {
                    self.cache
                        .update_status(&existing.client_msg_id, owner_user_id, remote_status)
                        .await?;
                    existing.status = remote_status;
                }
            } else {
                let m = LocalMessage::from_remote(owner_user_id, rm);
                self.cache.upsert_message(&m).await?;
                local.push(m);
            }
        }
        local.sort_by_key(|m| m.send_time);
        Ok(local)
    }

    /// 订阅会话预览列表（活跃流）
    ///
    /// 完全由本地缓存派生：每次缓存变更后重算"每个对端的最新一条消息"，
    /// 解析对端用户快照（未命中时触发目录查询并写穿），统计未读数，
    /// 按最新消息时间降序。任何装配失败都降级为空列表，预览流不报错。
    pub async fn watch_chat_previews(
        &self,
        owner_user_id: &str,
    ) -> mpsc::Receiver<Vec<ChatPreview>> {
        let (tx, rx) = mpsc::channel(32);
        let engine = self.clone();
        let owner = owner_user_id.to_string();
        tokio::spawn(async move {
            let mut changes = engine.cache.subscribe_changes();
            let mut last_emitted: Option<Vec<ChatPreview>> = None;
            loop {
                let previews = match engine.build_chat_previews(&owner).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("[SyncEngine] 装配会话预览失败: {e}");
                        Vec::new()
                    }
                };
                if last_emitted.as_ref() != Some(&previews) {
                    if tx.send(previews.clone()).await.is_err() {
                        break;
                    }
                    last_emitted = Some(previews);
                }

                tokio::select! {
                    changed = changes.recv() => {
                        match changed {
                            Ok(()) | Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => break,
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            debug!("[SyncEngine] 会话预览订阅结束: owner={owner}");
        });
        rx
    }

    async fn build_chat_previews(&self, owner_user_id: &str) -> Result<Vec<ChatPreview>> {
        // latest_message_per_partner 已按最新消息时间降序返回
        let latest = self.cache.latest_message_per_partner(owner_user_id).await?;
        let mut previews = Vec::with_capacity(latest.len());
        for msg in latest {
            let user = self.resolve_user(&msg.partner_user_id).await;
            let unread = self
                .cache
                .unread_count(&msg.partner_user_id, owner_user_id)
                .await?;
            previews.push(ChatPreview {
                partner_user_id: msg.partner_user_id.clone(),
                user,
                latest_msg: msg.content.clone(),
                latest_msg_send_time: msg.send_time,
                unread_count: unread,
            });
        }
        Ok(previews)
    }

    /// 解析用户快照：本地命中直接用，未命中触发目录查询并写穿缓存
    async fn resolve_user(&self, user_id: &str) -> Option<LocalUser> {
        match self.users.find_by_id(user_id).await {
            Ok(Some(user)) => return Some(user),
            Ok(None) => {}
            Err(e) => {
                warn!("[SyncEngine] 查询本地用户快照失败: {e}");
                return None;
            }
        }
        match self.gateway.find_user(user_id).await {
            Ok(Some(remote)) => {
                let user = LocalUser::from_remote(&remote, chrono::Utc::now().timestamp_millis());
                if let Err(e) = self.users.upsert_user(&user).await {
                    warn!("[SyncEngine] 写入用户快照失败: {e}");
                }
                Some(user)
            }
            Ok(None) => None,
            Err(e) => {
                debug!("[SyncEngine] 远端目录查询失败: {e}");
                None
            }
        }
    }

    /// 全量同步所有会话
    ///
    /// 对端列表拿不到则本轮同步失败；单个会话的历史拉取/用户解析失败
    /// 只记录并跳过，不影响其余会话。
    pub async fn sync_all_conversations(&self, owner_user_id: &str) -> Result<(), SyncError> {
        self.listener.on_sync_server_start().await;
        let partners = match self.gateway.list_conversation_partners(owner_user_id).await {
            Ok(p) => p,
            Err(e) => {
                self.listener.on_sync_server_failed(e.to_string()).await;
                return Err(SyncError::RemoteRead(e));
            }
        };

        info!("[SyncEngine] 全量同步开始，共 {} 个会话", partners.len());
        for partner in &partners {
            if let Err(e) = self.sync_one_conversation(owner_user_id, partner).await {
                warn!("[SyncEngine] 会话同步失败 partner={partner}: {e}");
            }
        }
        self.listener.on_sync_server_finish().await;
        info!("[SyncEngine] 全量同步完成");
        Ok(())
    }

    async fn sync_one_conversation(&self, owner_user_id: &str, partner_user_id: &str) -> Result<()> {
        let mut history = self
            .gateway
            .fetch_history(owner_user_id, partner_user_id, self.config.history_window)
            .await?;
        // 拉取结果无序：排序后只保留窗口内最新的一段
        history.sort_by_key(|m| m.send_time);
        if history.len() > self.config.history_window {
            history.drain(..history.len() - self.config.history_window);
        }

        let local = self
            .cache
            .messages_for_chat(partner_user_id, owner_user_id)
            .await?;
        let mut fresh = Vec::new();
        for rm in &history {
            match local.iter().find(|m| m.client_msg_id == rm.client_msg_id) {
                Some(existing) => {
                    // 历史回写同样只允许状态前移
                    let remote_status = MessageStatus::from_i32(rm.status);
                    if remote_status > existing.status {
                        self.cache
                            .update_status(&existing.client_msg_id, owner_user_id, remote_status)
                            .await?;
                    }
                }
                None => fresh.push(LocalMessage::from_remote(owner_user_id, rm)),
            }
        }
        self.cache.upsert_messages(&fresh).await?;

        if self.resolve_user(partner_user_id).await.is_none() {
            debug!("[SyncEngine] 对端用户快照暂不可得: {partner_user_id}");
        }
        Ok(())
    }

    /// 标记某会话的对端消息为已读
    ///
    /// 本地无条件先行生效；远端尽力而为，失败不回滚本地。
    pub async fn mark_messages_as_seen(
        &self,
        owner_user_id: &str,
        partner_user_id: &str,
    ) -> Result<(), SyncError> {
        self.cache
            .mark_seen(partner_user_id, owner_user_id)
            .await
            .map_err(SyncError::LocalPersistence)?;
        if let Err(e) = self
            .gateway
            .mark_seen(owner_user_id, partner_user_id)
            .await
        {
            warn!("[SyncEngine] 远端标记已读失败（本地已生效）: {e}");
        }
        Ok(())
    }

    /// 登出清理：只删除指定账号的缓存行，不触碰其他账号
    ///
    /// 会话状态异常拿不到 owner 时整库清空兜底。
    pub async fn clear_local_data(&self, owner_user_id: Option<&str>) -> Result<(), SyncError> {
        match owner_user_id {
            Some(owner) => {
                info!("[SyncEngine] 清理账号本地数据: {owner}");
                self.cache
                    .delete_by_owner(owner)
                    .await
                    .map_err(SyncError::LocalPersistence)
            }
            None => {
                warn!("[SyncEngine] 未知登录账号，清空全部本地缓存");
                self.cache
                    .delete_all()
                    .await
                    .map_err(SyncError::LocalPersistence)?;
                self.users
                    .delete_all()
                    .await
                    .map_err(SyncError::LocalPersistence)
            }
        }
    }

    /// 搜索目录用户
    ///
    /// 远端结果写穿本地缓存；远端不可达时退回本地缓存的子串搜索。
    pub async fn search_users(&self, keyword: &str) -> Result<Vec<LocalUser>, SyncError> {
        match self.gateway.search_users(keyword).await {
            Ok(remote) => {
                let now = chrono::Utc::now().timestamp_millis();
                let users: Vec<LocalUser> = remote
                    .iter()
                    .map(|u| LocalUser::from_remote(u, now))
                    .collect();
                if let Err(e) = self.users.upsert_users(&users).await {
                    warn!("[SyncEngine] 搜索结果写入缓存失败: {e}");
                }
                Ok(users)
            }
            Err(e) => {
                debug!("[SyncEngine] 远端搜索失败，退回本地缓存: {e}");
                self.users
                    .search(keyword)
                    .await
                    .map_err(SyncError::LocalPersistence)
            }
        }
    }

    /// 清理过期的目录用户快照，返回清理条数
    pub async fn prune_stale_users(&self) -> Result<u64, SyncError> {
        let cutoff = chrono::Utc::now().timestamp_millis() - USER_CACHE_TTL_MS;
        self.users
            .prune_older_than(cutoff)
            .await
            .map_err(SyncError::LocalPersistence)
    }
}

/// 远端缺席时的占位接收端：发送端挂在 `slot` 上，该接收端永远不会产出
fn idle_remote(
    slot: &mut Option<mpsc::Sender<Vec<RemoteMessage>>>,
) -> mpsc::Receiver<Vec<RemoteMessage>> {
    let (tx, rx) = mpsc::channel(1);
    *slot = Some(tx);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::types::RemoteUser;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex as StdMutex, Once};
    use std::time::Duration;
    use tokio::time::timeout;

    static INIT_LOGGER: Once = Once::new();

    fn init_test_logger() {
        INIT_LOGGER.call_once(|| {
            use tracing_subscriber::prelude::*;
            use tracing_subscriber::EnvFilter;

            let filter_layer =
                EnvFilter::new("info,weiliao_sdk_core_rust=debug,sqlx=info");
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(false)
                .with_test_writer();

            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .init();
        });
    }

    /// 可编排的内存网关：记录 send 调用，支持注入推送快照与故障开关
    #[derive(Default)]
    struct MockGateway {
        send_log: StdMutex<Vec<RemoteMessage>>,
        fail_send: AtomicBool,
        fail_subscribe: AtomicBool,
        fail_list_partners: AtomicBool,
        fail_search: AtomicBool,
        fail_mark_seen: AtomicBool,
        partners: StdMutex<Vec<String>>,
        history: StdMutex<HashMap<String, Vec<RemoteMessage>>>,
        users: StdMutex<HashMap<String, RemoteUser>>,
        push_senders: StdMutex<HashMap<String, mpsc::Sender<Vec<RemoteMessage>>>>,
    }

    impl MockGateway {
        fn sent(&self) -> Vec<RemoteMessage> {
            self.send_log.lock().unwrap().clone()
        }

        fn add_user(&self, id: &str, nickname: &str) {
            self.users.lock().unwrap().insert(
                id.to_string(),
                RemoteUser {
                    user_id: id.to_string(),
                    nickname: nickname.to_string(),
                    phone_number: String::new(),
                    face_url: String::new(),
                },
            );
        }

        async fn push_snapshot(&self, partner: &str, msgs: Vec<RemoteMessage>) {
            let tx = self.push_senders.lock().unwrap().get(partner).cloned();
            tx.expect("该会话还没有订阅者")
                .send(msgs)
                .await
                .expect("推送快照失败");
        }

        async fn wait_subscribed(&self, partner: &str) {
            for _ in 0..100 {
                if self.push_senders.lock().unwrap().contains_key(partner) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("订阅未建立: {partner}");
        }
    }

    #[async_trait]
    impl MessageGateway for MockGateway {
        async fn send(&self, msg: &RemoteMessage) -> Result<String> {
            if self.fail_send.load(Ordering::SeqCst) {
                anyhow::bail!("mock: 投递失败");
            }
            self.send_log.lock().unwrap().push(msg.clone());
            Ok(msg.client_msg_id.clone())
        }

        async fn subscribe_chat(
            &self,
            _owner_user_id: &str,
            partner_user_id: &str,
        ) -> Result<mpsc::Receiver<Vec<RemoteMessage>>> {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                anyhow::bail!("mock: 订阅失败");
            }
            let (tx, rx) = mpsc::channel(16);
            self.push_senders
                .lock()
                .unwrap()
                .insert(partner_user_id.to_string(), tx);
            Ok(rx)
        }

        async fn fetch_history(
            &self,
            _owner_user_id: &str,
            partner_user_id: &str,
            _limit: usize,
        ) -> Result<Vec<RemoteMessage>> {
            self.history
                .lock()
                .unwrap()
                .get(partner_user_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("mock: 无历史数据"))
        }

        async fn list_conversation_partners(&self, _owner_user_id: &str) -> Result<Vec<String>> {
            if self.fail_list_partners.load(Ordering::SeqCst) {
                anyhow::bail!("mock: 会话列表不可用");
            }
            Ok(self.partners.lock().unwrap().clone())
        }

        async fn mark_seen(&self, _owner_user_id: &str, _partner_user_id: &str) -> Result<()> {
            if self.fail_mark_seen.load(Ordering::SeqCst) {
                anyhow::bail!("mock: 标记已读失败");
            }
            Ok(())
        }

        async fn find_user(&self, user_id: &str) -> Result<Option<RemoteUser>> {
            Ok(self.users.lock().unwrap().get(user_id).cloned())
        }

        async fn search_users(&self, keyword: &str) -> Result<Vec<RemoteUser>> {
            if self.fail_search.load(Ordering::SeqCst) {
                anyhow::bail!("mock: 搜索失败");
            }
            let keyword = keyword.to_lowercase();
            Ok(self
                .users
                .lock()
                .unwrap()
                .values()
                .filter(|u| u.nickname.to_lowercase().contains(&keyword))
                .cloned()
                .collect())
        }
    }

    struct TestBed {
        _dir: tempfile::TempDir,
        engine: Arc<SyncEngine>,
        gateway: Arc<MockGateway>,
        cache: Arc<MessageCache>,
        users: Arc<UserCache>,
        session: Arc<AuthSession>,
    }

    async fn test_bed() -> TestBed {
        init_test_logger();
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let db_url = format!("sqlite://{}/cache.db?mode=rwc", dir.path().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .expect("连接测试数据库失败");
        let cache = Arc::new(MessageCache::new(pool.clone()));
        cache.init_db().await.expect("初始化消息表失败");
        let users = Arc::new(UserCache::new(pool));
        users.init_db().await.expect("初始化用户表失败");

        let gateway = Arc::new(MockGateway::default());
        let session = Arc::new(AuthSession::new());
        session.sign_in("o1".to_string(), "token".to_string());

        let engine = Arc::new(SyncEngine::new(
            SyncEngineConfig { history_window: 3 },
            cache.clone(),
            users.clone(),
            gateway.clone(),
            session.clone(),
        ));
        TestBed {
            _dir: dir,
            engine,
            gateway,
            cache,
            users,
            session,
        }
    }

    fn remote(id: &str, send_id: &str, recv_id: &str, ts: i64, status: MessageStatus) -> RemoteMessage {
        RemoteMessage {
            client_msg_id: id.to_string(),
            send_id: send_id.to_string(),
            recv_id: recv_id.to_string(),
            content: format!("msg-{id}"),
            send_time: ts,
            status: status.as_i32(),
        }
    }

    fn seeded(
        id: &str,
        owner: &str,
        partner: &str,
        is_self: bool,
        ts: i64,
        status: MessageStatus,
    ) -> LocalMessage {
        let (send_id, recv_id) = if is_self {
            (owner.to_string(), partner.to_string())
        } else {
            (partner.to_string(), owner.to_string())
        };
        LocalMessage {
            client_msg_id: id.to_string(),
            owner_user_id: owner.to_string(),
            partner_user_id: partner.to_string(),
            send_id,
            recv_id,
            content: format!("msg-{id}"),
            send_time: ts,
            status,
            is_self,
        }
    }

    async fn next_frame<T>(rx: &mut mpsc::Receiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("等待推送帧超时")
            .expect("流已关闭")
    }

    #[tokio::test]
    async fn test_send_message_online_marks_sent() {
        let bed = test_bed().await;
        let msg = bed
            .engine
            .send_message("o1", "p1", "你好", true)
            .await
            .expect("发送失败");

        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(bed.gateway.sent().len(), 1);

        let cached = bed.cache.messages_for_chat("p1", "o1").await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].client_msg_id, msg.client_msg_id);
        assert_eq!(cached[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_send_message_offline_keeps_pending_without_gateway_call() {
        let bed = test_bed().await;
        let msg = bed
            .engine
            .send_message("o1", "p1", "离线消息", false)
            .await
            .expect("发送失败");

        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(bed.gateway.sent().is_empty());

        let cached = bed.cache.messages_for_chat("p1", "o1").await.unwrap();
        assert_eq!(cached[0].status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn test_send_message_rolls_back_to_pending_on_failure() {
        let bed = test_bed().await;
        bed.gateway.fail_send.store(true, Ordering::SeqCst);

        let err = bed
            .engine
            .send_message("o1", "p1", "会失败", true)
            .await
            .expect_err("应返回投递失败");
        assert!(matches!(err, SyncError::RemoteDelivery(_)));

        let cached = bed.cache.messages_for_chat("p1", "o1").await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn test_send_message_rejects_unknown_owner() {
        let bed = test_bed().await;
        let err = bed
            .engine
            .send_message("别的账号", "p1", "hi", true)
            .await
            .expect_err("应拒绝未登录身份");
        assert!(matches!(err, SyncError::NotAuthenticated));
        assert!(bed.gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_passes_empty_text_through() {
        let bed = test_bed().await;
        let msg = bed
            .engine
            .send_message("o1", "p1", "", true)
            .await
            .expect("空文本应原样透传");
        assert_eq!(msg.content, "");
        assert_eq!(bed.cache.messages_for_chat("p1", "o1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_pending_messages_is_idempotent() {
        let bed = test_bed().await;
        bed.engine.send_message("o1", "p1", "一", false).await.unwrap();
        bed.engine.send_message("o1", "p2", "二", false).await.unwrap();

        let first = bed.engine.sync_pending_messages("o1").await.unwrap();
        assert_eq!(first, 2);
        assert_eq!(bed.gateway.sent().len(), 2);
        assert!(bed.cache.pending_messages("o1").await.unwrap().is_empty());

        let second = bed.engine.sync_pending_messages("o1").await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(bed.gateway.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_pending_continues_past_individual_failures() {
        let bed = test_bed().await;
        bed.engine.send_message("o1", "p1", "一", false).await.unwrap();
        bed.engine.send_message("o1", "p2", "二", false).await.unwrap();

        bed.gateway.fail_send.store(true, Ordering::SeqCst);
        let retried = bed.engine.sync_pending_messages("o1").await.unwrap();
        assert_eq!(retried, 0);
        // 两条都保持 PENDING，下一轮还能补发
        assert_eq!(bed.cache.pending_messages("o1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_pending_uses_row_sender() {
        let bed = test_bed().await;
        // 换号前写入的行：owner 是 o1，作者是旧账号
        let mut row = seeded("m-old", "o1", "p1", true, 100, MessageStatus::Pending);
        row.send_id = "旧账号".to_string();
        bed.cache.upsert_message(&row).await.unwrap();

        bed.engine.sync_pending_messages("o1").await.unwrap();
        let sent = bed.gateway.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].send_id, "旧账号");
    }

    #[tokio::test]
    async fn test_merge_keeps_local_status_when_remote_behind() {
        let bed = test_bed().await;
        bed.cache
            .upsert_message(&seeded("m1", "o1", "p1", true, 100, MessageStatus::Sent))
            .await
            .unwrap();

        let merged = bed
            .engine
            .merge_chat_snapshot("o1", "p1", &[remote("m1", "o1", "p1", 100, MessageStatus::Pending)])
            .await
            .unwrap();
        assert_eq!(merged[0].status, MessageStatus::Sent);

        let cached = bed.cache.messages_for_chat("p1", "o1").await.unwrap();
        assert_eq!(cached[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_merge_advances_status_forward() {
        let bed = test_bed().await;
        bed.cache
            .upsert_message(&seeded("m1", "o1", "p1", true, 100, MessageStatus::Sent))
            .await
            .unwrap();

        let merged = bed
            .engine
            .merge_chat_snapshot("o1", "p1", &[remote("m1", "o1", "p1", 100, MessageStatus::Seen)])
            .await
            .unwrap();
        assert_eq!(merged[0].status, MessageStatus::Seen);

        let cached = bed.cache.messages_for_chat("p1", "o1").await.unwrap();
        assert_eq!(cached[0].status, MessageStatus::Seen);
    }

    #[tokio::test]
    async fn test_merge_writes_through_remote_only_messages() {
        let bed = test_bed().await;
        bed.cache
            .upsert_message(&seeded("m1", "o1", "p1", true, 100, MessageStatus::Sent))
            .await
            .unwrap();

        let merged = bed
            .engine
            .merge_chat_snapshot(
                "o1",
                "p1",
                &[remote("r1", "p1", "o1", 50, MessageStatus::Delivered)],
            )
            .await
            .unwrap();

        // 远端独有的消息写穿入库，状态保留，结果按时间排序
        let ids: Vec<&str> = merged.iter().map(|m| m.client_msg_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "m1"]);

        let cached = bed.cache.messages_for_chat("p1", "o1").await.unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0].client_msg_id, "r1");
        assert_eq!(cached[0].status, MessageStatus::Delivered);
        assert!(!cached[0].is_self);
    }

    #[tokio::test]
    async fn test_merge_empty_remote_returns_local_unchanged() {
        let bed = test_bed().await;
        bed.cache
            .upsert_message(&seeded("m1", "o1", "p1", true, 100, MessageStatus::Sent))
            .await
            .unwrap();

        let merged = bed.engine.merge_chat_snapshot("o1", "p1", &[]).await.unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].client_msg_id, "m1");
    }

    #[tokio::test]
    async fn test_watch_chat_emits_cached_snapshot_first() {
        let bed = test_bed().await;
        bed.cache
            .upsert_messages(&[
                seeded("m1", "o1", "p1", false, 100, MessageStatus::Sent),
                seeded("m2", "o1", "p1", true, 200, MessageStatus::Sent),
            ])
            .await
            .unwrap();

        let mut rx = bed.engine.watch_chat("o1", "p1").await;
        let first = next_frame(&mut rx).await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].client_msg_id, "m1");
    }

    #[tokio::test]
    async fn test_watch_chat_survives_remote_subscribe_failure() {
        let bed = test_bed().await;
        bed.gateway.fail_subscribe.store(true, Ordering::SeqCst);
        bed.cache
            .upsert_message(&seeded("m1", "o1", "p1", true, 100, MessageStatus::Sent))
            .await
            .unwrap();

        let mut rx = bed.engine.watch_chat("o1", "p1").await;
        let first = next_frame(&mut rx).await;
        assert_eq!(first.len(), 1);

        // 远端不可用时流仍然跟随本地变更
        bed.cache
            .upsert_message(&seeded("m2", "o1", "p1", false, 200, MessageStatus::Sent))
            .await
            .unwrap();
        let second = next_frame(&mut rx).await;
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_watch_chat_merges_pushed_snapshot() {
        let bed = test_bed().await;
        bed.cache
            .upsert_message(&seeded("m1", "o1", "p1", true, 100, MessageStatus::Sent))
            .await
            .unwrap();

        let mut rx = bed.engine.watch_chat("o1", "p1").await;
        let _initial = next_frame(&mut rx).await;

        bed.gateway.wait_subscribed("p1").await;
        bed.gateway
            .push_snapshot(
                "p1",
                vec![
                    remote("m1", "o1", "p1", 100, MessageStatus::Sent),
                    remote("r1", "p1", "o1", 200, MessageStatus::Sent),
                ],
            )
            .await;

        loop {
            let frame = next_frame(&mut rx).await;
            if frame.iter().any(|m| m.client_msg_id == "r1") {
                break;
            }
        }
        // 写穿：合并过后远端消息已在缓存
        let cached = bed.cache.messages_for_chat("p1", "o1").await.unwrap();
        assert!(cached.iter().any(|m| m.client_msg_id == "r1"));
    }

    #[tokio::test]
    async fn test_chat_previews_sorted_with_unread_counts() {
        let bed = test_bed().await;
        bed.gateway.add_user("pa", "阿涛");
        bed.gateway.add_user("pb", "小雨");
        bed.cache
            .upsert_messages(&[
                seeded("a1", "o1", "pa", false, 100, MessageStatus::Seen),
                seeded("b1", "o1", "pb", false, 150, MessageStatus::Sent),
                seeded("b2", "o1", "pb", false, 200, MessageStatus::Delivered),
                seeded("b3", "o1", "pb", false, 250, MessageStatus::Seen),
            ])
            .await
            .unwrap();

        let mut rx = bed.engine.watch_chat_previews("o1").await;
        let previews = next_frame(&mut rx).await;

        assert_eq!(previews.len(), 2);
        assert_eq!(previews[0].partner_user_id, "pb");
        assert_eq!(previews[0].latest_msg_send_time, 250);
        assert_eq!(previews[0].unread_count, 2);
        assert_eq!(previews[1].partner_user_id, "pa");
        assert_eq!(previews[1].unread_count, 0);

        // 对端快照经目录查询写穿本地
        assert_eq!(
            previews[0].user.as_ref().map(|u| u.nickname.as_str()),
            Some("小雨")
        );
        assert!(bed.users.find_by_id("pb").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_all_conversations_applies_window_and_users() {
        let bed = test_bed().await;
        bed.gateway.add_user("p1", "阿涛");
        bed.gateway.partners.lock().unwrap().push("p1".to_string());
        bed.gateway.history.lock().unwrap().insert(
            "p1".to_string(),
            (1..=5)
                .map(|i| remote(&format!("h{i}"), "p1", "o1", i * 10, MessageStatus::Sent))
                .collect(),
        );

        bed.engine.sync_all_conversations("o1").await.unwrap();

        // 窗口为 3：只保留时间最新的三条
        let cached = bed.cache.messages_for_chat("p1", "o1").await.unwrap();
        let ids: Vec<&str> = cached.iter().map(|m| m.client_msg_id.as_str()).collect();
        assert_eq!(ids, vec!["h3", "h4", "h5"]);
        assert!(bed.users.find_by_id("p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_all_conversations_skips_failed_partner() {
        let bed = test_bed().await;
        {
            let mut partners = bed.gateway.partners.lock().unwrap();
            partners.push("没历史的".to_string());
            partners.push("p2".to_string());
        }
        bed.gateway.history.lock().unwrap().insert(
            "p2".to_string(),
            vec![remote("h1", "p2", "o1", 10, MessageStatus::Sent)],
        );

        bed.engine.sync_all_conversations("o1").await.unwrap();
        assert_eq!(bed.cache.messages_for_chat("p2", "o1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_all_conversations_fails_without_partner_list() {
        let bed = test_bed().await;
        bed.gateway.fail_list_partners.store(true, Ordering::SeqCst);
        let err = bed
            .engine
            .sync_all_conversations("o1")
            .await
            .expect_err("会话列表不可用应失败");
        assert!(matches!(err, SyncError::RemoteRead(_)));
    }

    #[tokio::test]
    async fn test_sync_all_does_not_regress_seen_status() {
        let bed = test_bed().await;
        bed.cache
            .upsert_message(&seeded("m1", "o1", "p1", false, 100, MessageStatus::Seen))
            .await
            .unwrap();
        bed.gateway.partners.lock().unwrap().push("p1".to_string());
        bed.gateway.history.lock().unwrap().insert(
            "p1".to_string(),
            vec![remote("m1", "p1", "o1", 100, MessageStatus::Sent)],
        );

        bed.engine.sync_all_conversations("o1").await.unwrap();
        let cached = bed.cache.messages_for_chat("p1", "o1").await.unwrap();
        assert_eq!(cached[0].status, MessageStatus::Seen);
    }

    #[tokio::test]
    async fn test_mark_seen_local_first_remote_best_effort() {
        let bed = test_bed().await;
        bed.gateway.fail_mark_seen.store(true, Ordering::SeqCst);
        bed.cache
            .upsert_message(&seeded("m1", "o1", "p1", false, 100, MessageStatus::Sent))
            .await
            .unwrap();

        // 远端失败不影响调用结果，本地已生效
        bed.engine.mark_messages_as_seen("o1", "p1").await.unwrap();
        let cached = bed.cache.messages_for_chat("p1", "o1").await.unwrap();
        assert_eq!(cached[0].status, MessageStatus::Seen);
    }

    #[tokio::test]
    async fn test_clear_local_data_is_owner_scoped() {
        let bed = test_bed().await;
        bed.cache
            .upsert_messages(&[
                seeded("m1", "o1", "p1", true, 100, MessageStatus::Sent),
                seeded("m2", "o2", "p1", true, 200, MessageStatus::Sent),
            ])
            .await
            .unwrap();

        bed.engine.clear_local_data(Some("o1")).await.unwrap();
        assert!(bed.cache.messages_for_chat("p1", "o1").await.unwrap().is_empty());
        assert_eq!(bed.cache.messages_for_chat("p1", "o2").await.unwrap().len(), 1);

        // 拿不到 owner 时整库清空兜底
        bed.engine.clear_local_data(None).await.unwrap();
        assert!(bed.cache.messages_for_chat("p1", "o2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_users_degrades_to_local_cache() {
        let bed = test_bed().await;
        bed.users
            .upsert_user(&LocalUser {
                user_id: "u1".to_string(),
                nickname: "阿涛".to_string(),
                phone_number: String::new(),
                face_url: String::new(),
                cached_at: 1,
            })
            .await
            .unwrap();
        bed.gateway.fail_search.store(true, Ordering::SeqCst);

        let hits = bed.engine.search_users("阿涛").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id, "u1");
    }

    #[tokio::test]
    async fn test_search_users_writes_through_remote_results() {
        let bed = test_bed().await;
        bed.gateway.add_user("u9", "小雨");

        let hits = bed.engine.search_users("小雨").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(bed.users.find_by_id("u9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sign_out_then_send_is_rejected() {
        let bed = test_bed().await;
        bed.session.sign_out();
        let err = bed
            .engine
            .send_message("o1", "p1", "hi", true)
            .await
            .expect_err("登出后应拒绝发送");
        assert!(matches!(err, SyncError::NotAuthenticated));
    }
}
