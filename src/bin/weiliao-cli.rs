//! 微聊 CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示 IM 功能：
//! 启动时通过命令行参数指定用户，自动登录连接，展示会话预览，
//! 可选发送一条消息并持续跟随某个会话的消息流。

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use weiliao_sdk_core_rust::im::client::{ClientConfig, IMClient};
use weiliao_sdk_core_rust::im::message::listener::MessageListener;
use weiliao_sdk_core_rust::login_async;

/// 微聊 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "weiliao-cli")]
#[command(about = "微聊 CLI 客户端 - 用于测试和展示 IM 功能", long_about = None)]
struct Args {
    /// 手机号
    #[arg(short, long, default_value = "17764338283")]
    phone: String,

    /// 登录服务地址
    #[arg(long, default_value = "http://localhost:10008")]
    auth_url: String,

    /// 会话对端用户 ID（指定后会跟随该会话的消息流）
    #[arg(long)]
    peer: Option<String>,

    /// 发送给对端的一条消息（需要同时指定 --peer）
    #[arg(short, long)]
    message: Option<String>,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别
    #[arg(long, default_value = "info,weiliao_sdk_core_rust=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

/// 事件监听器（输出所有引擎事件）
struct CliMessageListener;

#[async_trait::async_trait]
impl MessageListener for CliMessageListener {
    async fn on_connection_status_changed(&self, connected: bool, message: String) {
        if connected {
            info!("[CLI/事件] 🔗 已连接: {}", message);
        } else {
            warn!("[CLI/事件] 🔗 断开连接: {}", message);
        }
    }

    async fn on_sync_server_start(&self) {
        info!("[CLI/事件] 🔄 会话同步开始");
    }

    async fn on_sync_server_finish(&self) {
        info!("[CLI/事件] ✅ 会话同步完成");
    }

    async fn on_sync_server_failed(&self, reason: String) {
        error!("[CLI/事件] ❌ 会话同步失败: {}", reason);
    }

    async fn on_pending_messages_retried(&self, retried: usize) {
        info!("[CLI/事件] 📤 待发送消息补发完成: {} 条", retried);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level);

    info!("[CLI] 🚀 微聊 CLI 客户端（测试模式）");
    info!("[CLI] 📱 手机号: {}", args.phone);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    // 登录
    info!("[CLI] 🔐 正在登录...");
    let area_code = "+86".to_string();
    let password = "284f3d09ea0695538e4ded1c1766d73a".to_string(); // 测试密码
    let platform = 5;

    let token_info = login_async(&args.auth_url, area_code, args.phone.clone(), password, platform)
        .await
        .map_err(|e| anyhow::anyhow!("登录失败: {}", e))?;

    let (user_id, im_token) = if let Some(data) = &token_info.data {
        (data.user_id.clone(), data.im_token.clone())
    } else {
        return Err(anyhow::anyhow!("登录失败：服务器返回数据为空"));
    };

    info!("[CLI] ✅ 登录成功！用户ID: {}", user_id);

    // 创建客户端并连接
    let config = ClientConfig::new(user_id.clone(), im_token);
    let mut client = IMClient::new(config);
    client.set_message_listener(Arc::new(CliMessageListener));

    info!("[CLI] 🔗 正在连接服务器...");
    client
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("连接失败: {}", e))?;
    info!("[CLI] ✅ 连接成功！");

    // 显示会话预览（首帧来自本地缓存，离线也有数据）
    {
        let mut previews_rx = client.watch_chat_previews().await?;
        if let Some(previews) = previews_rx.recv().await {
            info!("[CLI] 📋 会话预览（共 {} 个）:", previews.len());
            for p in previews.iter().take(5) {
                let name = p
                    .user
                    .as_ref()
                    .map(|u| u.nickname.clone())
                    .unwrap_or_else(|| p.partner_user_id.clone());
                let latest = if p.latest_msg.chars().count() > 30 {
                    p.latest_msg.chars().take(30).collect::<String>()
                } else {
                    p.latest_msg.clone()
                };
                info!("[CLI]   - {} | 未读: {} | 最新: {}", name, p.unread_count, latest);
            }
        }
    }

    // 可选：发送一条消息
    if let Some(text) = &args.message {
        let peer = args
            .peer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("--message 需要同时指定 --peer"))?;
        info!("[CLI] 📤 发送消息给 {}: {}", peer, text);
        match client.send_text_message(peer, text).await {
            Ok(msg) => info!(
                "[CLI] ✅ 已发送（状态 {:?}）: {}",
                msg.status, msg.client_msg_id
            ),
            Err(e) => error!("[CLI] ❌ 发送失败: {}", e),
        }
    }

    // 可选：跟随某会话的消息流
    if let Some(peer) = args.peer.clone() {
        let mut chat_rx = client.watch_chat(&peer).await?;
        tokio::spawn(async move {
            while let Some(list) = chat_rx.recv().await {
                info!("[CLI] 💬 会话 {} 共 {} 条消息", peer, list.len());
                if let Some(last) = list.last() {
                    info!(
                        "[CLI]   最新: [{}] {} ({:?})",
                        if last.is_self { "我" } else { "对方" },
                        last.content,
                        last.status
                    );
                }
            }
        });
    }

    info!("[CLI] 📥 开始监听消息...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
        info!("[CLI] 👋 程序退出");
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        loop {
            sleep(Duration::from_secs(3600)).await;
        }
    }

    Ok(())
}
