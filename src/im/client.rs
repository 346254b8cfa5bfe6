//! IM 客户端组合根
//!
//! 负责把缓存、网关、引擎、连通性监视器按依赖顺序装配起来；
//! 缓存实例在这里显式构造并注入引擎，生命周期由客户端持有。

use crate::im::auth::AuthSession;
use crate::im::connectivity::ConnectivityMonitor;
use crate::im::db::create_sqlite_pool;
use crate::im::error::SyncError;
use crate::im::gateway::{GatewayConfig, HttpMessageGateway};
use crate::im::message::dao::MessageCache;
use crate::im::message::listener::{EmptyMessageListener, MessageListener};
use crate::im::message::models::{ChatPreview, LocalMessage};
use crate::im::message::service::{SyncEngine, SyncEngineConfig, DEFAULT_HISTORY_WINDOW};
use crate::im::user::dao::UserCache;
use crate::im::user::models::LocalUser;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 用户 ID
    pub user_id: String,
    /// 认证 token
    pub token: String,
    /// WebSocket 服务器 URL
    pub ws_url: String,
    /// HTTP API 基础地址
    pub api_base_url: String,
    /// 本地 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://weiliao.db?mode=rwc`
    pub db_url: String,
    /// 压缩方式，例如 "gzip" 或空字符串表示不压缩
    pub compression: String,
    /// 全量同步时每个会话拉取的历史消息条数上限
    pub history_window: usize,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(user_id: String, token: String) -> Self {
        Self {
            user_id,
            token,
            ws_url: "ws://localhost:10001".to_string(),
            api_base_url: "http://localhost:10002".to_string(),
            db_url: "sqlite://weiliao.db?mode=rwc".to_string(),
            compression: "gzip".to_string(),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

/// IM 客户端
pub struct IMClient {
    config: ClientConfig,
    session: Arc<AuthSession>,
    listener: Arc<dyn MessageListener>,
    engine: Option<Arc<SyncEngine>>,
    connectivity: Option<watch::Receiver<bool>>,
}

impl IMClient {
    /// 创建新的客户端
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            session: Arc::new(AuthSession::new()),
            listener: Arc::new(EmptyMessageListener),
            engine: None,
            connectivity: None,
        }
    }

    /// 注册事件监听器（需在 connect 之前调用）
    pub fn set_message_listener(&mut self, listener: Arc<dyn MessageListener>) {
        self.listener = listener;
    }

    /// 连接：建库、装配网关与引擎、启动连通性监视与后台全量同步
    pub async fn connect(&mut self) -> Result<()> {
        info!("[Client] 🔗 初始化本地缓存: {}", self.config.db_url);
        let pool = create_sqlite_pool(&self.config.db_url)
            .await
            .context(format!("连接SQLite数据库失败: {}", self.config.db_url))?;
        let cache = Arc::new(MessageCache::new(pool.clone()));
        cache.init_db().await?;
        let users = Arc::new(UserCache::new(pool));
        users.init_db().await?;

        self.session
            .sign_in(self.config.user_id.clone(), self.config.token.clone());

        let gateway = Arc::new(HttpMessageGateway::connect(GatewayConfig {
            user_id: self.config.user_id.clone(),
            token: self.config.token.clone(),
            api_base_url: self.config.api_base_url.clone(),
            ws_url: self.config.ws_url.clone(),
            compression: self.config.compression.clone(),
        })?);
        let connectivity = gateway.connectivity();

        let engine = Arc::new(SyncEngine::with_listener(
            SyncEngineConfig {
                history_window: self.config.history_window,
            },
            cache,
            users,
            gateway,
            self.session.clone(),
            self.listener.clone(),
        ));

        // 网络恢复时自动补发待发送消息
        ConnectivityMonitor::spawn(
            engine.clone(),
            self.config.user_id.clone(),
            connectivity.clone(),
        );

        // 后台全量同步 + 目录缓存保鲜
        let engine_for_sync = engine.clone();
        let owner = self.config.user_id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine_for_sync.prune_stale_users().await {
                error!("[Client] 清理过期用户快照失败: {e}");
            }
            info!("[Client] 🔄 启动全量会话同步任务");
            match engine_for_sync.sync_all_conversations(&owner).await {
                Ok(()) => info!("[Client] ✅ 会话同步完成"),
                Err(e) => error!("[Client] ❌ 会话同步失败: {e}"),
            }
        });

        self.engine = Some(engine);
        self.connectivity = Some(connectivity);
        Ok(())
    }

    fn engine(&self) -> Result<&Arc<SyncEngine>> {
        self.engine.as_ref().ok_or_else(|| anyhow::anyhow!("未连接"))
    }

    /// 当前是否在线（推送连接存活）
    pub fn is_online(&self) -> bool {
        self.connectivity
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    /// 发送文本消息（在线状态取自推送连接）
    pub async fn send_text_message(
        &self,
        recv_id: &str,
        text: &str,
    ) -> Result<LocalMessage, SyncError> {
        let engine = self.engine.as_ref().ok_or(SyncError::NotAuthenticated)?;
        engine
            .send_message(&self.config.user_id, recv_id, text, self.is_online())
            .await
    }

    /// 订阅某会话的消息列表
    pub async fn watch_chat(&self, partner_user_id: &str) -> Result<mpsc::Receiver<Vec<LocalMessage>>> {
        Ok(self
            .engine()?
            .watch_chat(&self.config.user_id, partner_user_id)
            .await)
    }

    /// 订阅会话预览列表
    pub async fn watch_chat_previews(&self) -> Result<mpsc::Receiver<Vec<ChatPreview>>> {
        Ok(self.engine()?.watch_chat_previews(&self.config.user_id).await)
    }

    /// 手动触发一轮待发送消息补发
    pub async fn sync_pending_messages(&self) -> Result<usize> {
        Ok(self
            .engine()?
            .sync_pending_messages(&self.config.user_id)
            .await?)
    }

    /// 标记某会话已读
    pub async fn mark_chat_as_seen(&self, partner_user_id: &str) -> Result<()> {
        self.engine()?
            .mark_messages_as_seen(&self.config.user_id, partner_user_id)
            .await?;
        Ok(())
    }

    /// 搜索目录用户
    pub async fn search_users(&self, keyword: &str) -> Result<Vec<LocalUser>> {
        Ok(self.engine()?.search_users(keyword).await?)
    }

    /// 登出：清除登录身份并删除本账号的本地缓存
    ///
    /// 会话状态异常时退化为清空整个缓存。
    pub async fn logout(&mut self) -> Result<()> {
        let engine = self.engine()?.clone();
        let signed_out = self.session.sign_out();
        match signed_out {
            Some(info) => engine.clear_local_data(Some(&info.user_id)).await?,
            None => engine.clear_local_data(None).await?,
        }
        self.engine = None;
        self.connectivity = None;
        info!("[Client] 👋 已登出");
        Ok(())
    }
}
