//! 目录用户数据访问层（DAO）
//!
//! 负责缓存用户相关的数据库操作，供会话预览与离线搜索使用。

use crate::im::user::models::LocalUser;
use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

/// 目录用户缓存保鲜期（毫秒），超过该时长的行可被清理
pub const USER_CACHE_TTL_MS: i64 = 7 * 24 * 3600 * 1000;

/// 本地目录用户缓存（基于 sqlx）
pub struct UserCache {
    db: Pool<Sqlite>,
}

impl UserCache {
    /// 创建新的用户缓存 DAO
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 初始化数据库表结构
    pub async fn init_db(&self) -> Result<()> {
        info!("[UserDAO/DB] 初始化目录用户表结构");
        let sql = r#"
            CREATE TABLE IF NOT EXISTS local_users (
                user_id      TEXT PRIMARY KEY,
                nickname     TEXT NOT NULL DEFAULT '',
                phone_number TEXT NOT NULL DEFAULT '',
                face_url     TEXT NOT NULL DEFAULT '',
                cached_at    INTEGER NOT NULL DEFAULT 0
            )
        "#;
        sqlx::query(sql)
            .execute(&self.db)
            .await
            .context("创建目录用户表失败")?;
        Ok(())
    }

    /// 插入或更新用户快照（按 user_id 覆盖写）
    pub async fn upsert_user(&self, user: &LocalUser) -> Result<()> {
        let sql = r#"
            INSERT INTO local_users (
                user_id, nickname, phone_number, face_url, cached_at
            ) VALUES (?,?,?,?,?)
            ON CONFLICT(user_id) DO UPDATE SET
                nickname = excluded.nickname,
                phone_number = excluded.phone_number,
                face_url = excluded.face_url,
                cached_at = excluded.cached_at
        "#;
        sqlx::query(sql)
            .bind(&user.user_id)
            .bind(&user.nickname)
            .bind(&user.phone_number)
            .bind(&user.face_url)
            .bind(user.cached_at)
            .execute(&self.db)
            .await
            .context("插入或更新用户快照失败")?;
        Ok(())
    }

    /// 批量插入或更新用户快照
    pub async fn upsert_users(&self, users: &[LocalUser]) -> Result<()> {
        for user in users {
            self.upsert_user(user).await?;
        }
        Ok(())
    }

    /// 按 user_id 查询单个用户快照
    pub async fn find_by_id(&self, user_id: &str) -> Result<Option<LocalUser>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, nickname, phone_number, face_url, cached_at
            FROM local_users
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await
        .context("查询用户快照失败")?;
        Ok(row.map(Self::row_to_user))
    }

    /// 按昵称/联系方式做大小写不敏感的子串搜索
    pub async fn search(&self, keyword: &str) -> Result<Vec<LocalUser>> {
        let pattern = format!("%{}%", keyword.to_lowercase());
        let rows = sqlx::query(
            r#"
            SELECT user_id, nickname, phone_number, face_url, cached_at
            FROM local_users
            WHERE LOWER(nickname) LIKE ? OR LOWER(phone_number) LIKE ?
            ORDER BY nickname
            "#,
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.db)
        .await
        .context("搜索用户快照失败")?;

        let users: Vec<LocalUser> = rows.into_iter().map(Self::row_to_user).collect();
        debug!("[UserDAO] 本地搜索 \"{}\"，命中 {} 个", keyword, users.len());
        Ok(users)
    }

    /// 清理 cached_at 早于给定时刻的行，返回清理条数
    pub async fn prune_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM local_users WHERE cached_at < ?")
            .bind(cutoff_ms)
            .execute(&self.db)
            .await
            .context("清理过期用户快照失败")?;
        if res.rows_affected() > 0 {
            info!("[UserDAO] 清理过期用户快照 {} 条", res.rows_affected());
        }
        Ok(res.rows_affected())
    }

    /// 清空全部用户快照
    pub async fn delete_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM local_users")
            .execute(&self.db)
            .await
            .context("清空用户快照失败")?;
        Ok(())
    }

    fn row_to_user(row: sqlx::sqlite::SqliteRow) -> LocalUser {
        LocalUser {
            user_id: row.try_get::<String, _>("user_id").unwrap_or_default(),
            nickname: row.try_get::<String, _>("nickname").unwrap_or_default(),
            phone_number: row
                .try_get::<String, _>("phone_number")
                .unwrap_or_default(),
            face_url: row.try_get::<String, _>("face_url").unwrap_or_default(),
            cached_at: row.try_get::<i64, _>("cached_at").unwrap_or_default(),
        }
    }
}
