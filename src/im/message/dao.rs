//! 消息数据访问层（DAO）
//!
//! 单表存储全部缓存消息，(partner, owner) 做二级索引；
//! 同一行的唯一性由 (client_msg_id, owner_user_id) 主键保证，
//! 冲突时整行覆盖（合并语义在同步引擎，不在存储层）。

use crate::im::message::models::{LocalMessage, MessageStatus};
use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use tokio::sync::broadcast;
use tracing::info;

const SELECT_COLUMNS: &str = r#"
    client_msg_id, owner_user_id, partner_user_id,
    send_id, recv_id, content, send_time, status, is_self
"#;

/// 本地消息缓存（sqlx / SQLite）
///
/// 所有写操作完成后都会触发一次变更信号，活跃查询的消费端收到信号后
/// 自行重查，得到的是完整的新快照而不是增量。
pub struct MessageCache {
    pool: Pool<Sqlite>,
    change_tx: broadcast::Sender<()>,
}

impl MessageCache {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        let (change_tx, _) = broadcast::channel(64);
        Self { pool, change_tx }
    }

    /// 独立建池并初始化表结构
    pub async fn connect(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;
        let cache = Self::new(pool);
        cache.init_db().await?;
        Ok(cache)
    }

    /// 初始化数据库表结构
    pub async fn init_db(&self) -> Result<()> {
        info!("[MsgDAO/DB] 初始化消息表结构");
        let sql = r#"
            CREATE TABLE IF NOT EXISTS local_messages (
                client_msg_id   TEXT NOT NULL,
                owner_user_id   TEXT NOT NULL,
                partner_user_id TEXT NOT NULL,
                send_id         TEXT NOT NULL,
                recv_id         TEXT NOT NULL,
                content         TEXT NOT NULL DEFAULT '',
                send_time       INTEGER NOT NULL DEFAULT 0,
                status          INTEGER NOT NULL DEFAULT 1,
                is_self         INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (client_msg_id, owner_user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_local_messages_chat
                ON local_messages(partner_user_id, owner_user_id);
            CREATE INDEX IF NOT EXISTS idx_local_messages_send_time
                ON local_messages(send_time);
            CREATE INDEX IF NOT EXISTS idx_local_messages_status
                ON local_messages(status);
        "#;
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .context("创建消息表失败")?;
        Ok(())
    }

    /// 订阅缓存变更信号
    ///
    /// 任何写操作（插入、状态更新、删除）之后触发一次；消费端自行重查快照。
    pub fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.change_tx.subscribe()
    }

    fn notify_changed(&self) {
        // 没有订阅者时发送会失败，属正常情况
        let _ = self.change_tx.send(());
    }

    /// 插入或更新一条消息（按主键整行覆盖）
    pub async fn upsert_message(&self, msg: &LocalMessage) -> Result<()> {
        self.upsert_inner(msg).await?;
        self.notify_changed();
        Ok(())
    }

    /// 批量插入或更新，全部落库后只触发一次变更信号
    pub async fn upsert_messages(&self, msgs: &[LocalMessage]) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }
        for msg in msgs {
            self.upsert_inner(msg).await?;
        }
        self.notify_changed();
        Ok(())
    }

    async fn upsert_inner(&self, msg: &LocalMessage) -> Result<()> {
        let sql = r#"
            INSERT INTO local_messages (
                client_msg_id, owner_user_id, partner_user_id,
                send_id, recv_id, content, send_time, status, is_self
            ) VALUES (?,?,?,?,?,?,?,?,?)
            ON CONFLICT(client_msg_id, owner_user_id) DO UPDATE SET
                partner_user_id = excluded.partner_user_id,
                send_id = excluded.send_id,
                recv_id = excluded.recv_id,
                content = excluded.content,
                send_time = excluded.send_time,
                status = excluded.status,
                is_self = excluded.is_self
        "#;
        sqlx::query(sql)
            .bind(&msg.client_msg_id)
            .bind(&msg.owner_user_id)
            .bind(&msg.partner_user_id)
            .bind(&msg.send_id)
            .bind(&msg.recv_id)
            .bind(&msg.content)
            .bind(msg.send_time)
            .bind(msg.status.as_i32())
            .bind(if msg.is_self { 1 } else { 0 })
            .execute(&self.pool)
            .await
            .context("插入或更新消息失败")?;
        Ok(())
    }

    /// 查询某会话的全部消息，按发送时间升序
    pub async fn messages_for_chat(
        &self,
        partner_user_id: &str,
        owner_user_id: &str,
    ) -> Result<Vec<LocalMessage>> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM local_messages
            WHERE partner_user_id = ? AND owner_user_id = ?
            ORDER BY send_time ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(partner_user_id)
            .bind(owner_user_id)
            .fetch_all(&self.pool)
            .await
            .context("查询会话消息失败")?;
        Ok(rows.into_iter().map(Self::row_to_message).collect())
    }

    /// 每个会话对端的最新一条消息，按发送时间降序
    pub async fn latest_message_per_partner(
        &self,
        owner_user_id: &str,
    ) -> Result<Vec<LocalMessage>> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM local_messages m
            WHERE m.owner_user_id = ?
              AND m.send_time = (
                  SELECT MAX(send_time) FROM local_messages
                  WHERE partner_user_id = m.partner_user_id AND owner_user_id = m.owner_user_id
              )
            GROUP BY m.partner_user_id
            ORDER BY m.send_time DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(owner_user_id)
            .fetch_all(&self.pool)
            .await
            .context("查询会话最新消息失败")?;
        Ok(rows.into_iter().map(Self::row_to_message).collect())
    }

    /// owner 名下所有待发送（PENDING）消息，按发送时间升序
    pub async fn pending_messages(&self, owner_user_id: &str) -> Result<Vec<LocalMessage>> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM local_messages
            WHERE owner_user_id = ? AND status = ?
            ORDER BY send_time ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(owner_user_id)
            .bind(MessageStatus::Pending.as_i32())
            .fetch_all(&self.pool)
            .await
            .context("查询待发送消息失败")?;
        Ok(rows.into_iter().map(Self::row_to_message).collect())
    }

    /// 按主键更新消息状态（无条件写入，状态序由引擎把关）
    pub async fn update_status(
        &self,
        client_msg_id: &str,
        owner_user_id: &str,
        status: MessageStatus,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE local_messages SET status = ?
            WHERE client_msg_id = ? AND owner_user_id = ?
            "#,
        )
        .bind(status.as_i32())
        .bind(client_msg_id)
        .bind(owner_user_id)
        .execute(&self.pool)
        .await
        .context("更新消息状态失败")?;
        if res.rows_affected() > 0 {
            self.notify_changed();
        }
        Ok(res.rows_affected())
    }

    /// 将对端发来的消息全部置为已读，返回变更条数
    pub async fn mark_seen(&self, partner_user_id: &str, owner_user_id: &str) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE local_messages SET status = ?
            WHERE partner_user_id = ? AND owner_user_id = ?
              AND is_self = 0 AND status != ?
            "#,
        )
        .bind(MessageStatus::Seen.as_i32())
        .bind(partner_user_id)
        .bind(owner_user_id)
        .bind(MessageStatus::Seen.as_i32())
        .execute(&self.pool)
        .await
        .context("标记已读失败")?;
        if res.rows_affected() > 0 {
            self.notify_changed();
        }
        Ok(res.rows_affected())
    }

    /// 对端发来且未读（状态非 SEEN）的消息条数
    pub async fn unread_count(&self, partner_user_id: &str, owner_user_id: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS unread FROM local_messages
            WHERE partner_user_id = ? AND owner_user_id = ?
              AND is_self = 0 AND status != ?
            "#,
        )
        .bind(partner_user_id)
        .bind(owner_user_id)
        .bind(MessageStatus::Seen.as_i32())
        .fetch_one(&self.pool)
        .await
        .context("统计未读消息失败")?;
        Ok(row.try_get::<i64, _>("unread")?)
    }

    /// 删除某会话的全部缓存消息
    pub async fn delete_chat(&self, partner_user_id: &str, owner_user_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM local_messages WHERE partner_user_id = ? AND owner_user_id = ?",
        )
        .bind(partner_user_id)
        .bind(owner_user_id)
        .execute(&self.pool)
        .await
        .context("删除会话消息失败")?;
        self.notify_changed();
        Ok(())
    }

    /// 删除某 owner 名下的全部缓存消息（不触碰其他账号的行）
    pub async fn delete_by_owner(&self, owner_user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM local_messages WHERE owner_user_id = ?")
            .bind(owner_user_id)
            .execute(&self.pool)
            .await
            .context("按账号删除消息失败")?;
        self.notify_changed();
        Ok(())
    }

    /// 清空全部缓存消息
    pub async fn delete_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM local_messages")
            .execute(&self.pool)
            .await
            .context("清空消息缓存失败")?;
        self.notify_changed();
        Ok(())
    }

    fn row_to_message(row: sqlx::sqlite::SqliteRow) -> LocalMessage {
        LocalMessage {
            client_msg_id: row
                .try_get::<String, _>("client_msg_id")
                .unwrap_or_default(),
            owner_user_id: row
                .try_get::<String, _>("owner_user_id")
                .unwrap_or_default(),
            partner_user_id: row
                .try_get::<String, _>("partner_user_id")
                .unwrap_or_default(),
            send_id: row.try_get::<String, _>("send_id").unwrap_or_default(),
            recv_id: row.try_get::<String, _>("recv_id").unwrap_or_default(),
            content: row.try_get::<String, _>("content").unwrap_or_default(),
            send_time: row.try_get::<i64, _>("send_time").unwrap_or_default(),
            status: MessageStatus::from_i32(row.try_get::<i32, _>("status").unwrap_or(1)),
            is_self: row.try_get::<i32, _>("is_self").unwrap_or_default() != 0,
        }
    }
}
