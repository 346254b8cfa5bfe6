//! SQLite 数据库工具：统一创建连接池
//!
//! 表结构由各 DAO 的 `init_db` 以 `CREATE TABLE IF NOT EXISTS` 方式维护，
//! 消息缓存与用户缓存共用同一个数据库文件。

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

/// 创建 SQLite 连接池
///
/// `db_url` 形如 `sqlite://weiliao.db?mode=rwc`。
pub async fn create_sqlite_pool(db_url: &str) -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;
    Ok(pool)
}
