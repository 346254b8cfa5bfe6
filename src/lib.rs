pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    auth::{login_async, AuthSession},
    client::{ClientConfig, IMClient},
    connectivity::ConnectivityMonitor,
    error::SyncError,
    gateway::{HttpMessageGateway, MessageGateway},
    message::{
        ChatPreview, EmptyMessageListener, LocalMessage, MessageCache, MessageListener,
        MessageStatus, SyncEngine, SyncEngineConfig,
    },
    user::{LocalUser, UserCache},
};
