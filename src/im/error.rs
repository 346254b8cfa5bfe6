//! 同步引擎边界错误定义
//!
//! DAO 与网关内部统一使用 anyhow，跨出引擎边界时收敛为以下分类，
//! 调用方按分类决定是否可重试。

use thiserror::Error;

/// 同步引擎错误分类
#[derive(Debug, Error)]
pub enum SyncError {
    /// 当前没有已登录的用户身份（不可重试）
    #[error("当前没有已登录的用户身份")]
    NotAuthenticated,

    /// 本地缓存读写失败（本地落库是所有写路径的前置条件，本次调用终止）
    #[error("本地缓存读写失败: {0}")]
    LocalPersistence(anyhow::Error),

    /// 远端投递失败（消息保持/回退为 PENDING，等待后续重试）
    #[error("远端投递失败: {0}")]
    RemoteDelivery(anyhow::Error),

    /// 远端读取失败（会话列表都拿不到，本轮同步无法启动）
    #[error("远端读取失败: {0}")]
    RemoteRead(anyhow::Error),
}
