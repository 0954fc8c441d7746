//! SQLite 存储后端实现
//!
//! 使用 sqlx 提供原生异步 SQLite 存储支持。
//!
//! 原子性依赖单条条件语句：核销是一条带守卫条件的 UPDATE，
//! 配额自增是一条带守卫条件的 UPSERT，`rows_affected` 区分成败。
//! WAL 模式下每条语句自动提交，变更在返回前已落盘。

use crate::error::{TksError, TksResult};
use crate::storage::backend::TokenStoreBackend;
use crate::storage::QUOTA_RETENTION_SECS;
use crate::types::{GrantRecord, TokenRecord};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// SQLite 存储后端
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// 创建新的 SQLite 后端实例
    ///
    /// # Arguments
    /// * `db_path` - 数据库文件存储目录路径（来自 KeygateConfig.sqlite_path）
    pub async fn new(db_path: &Path) -> TksResult<Self> {
        let file = db_path.join("tks_tokens.db");

        // 创建连接选项并启用 WAL 模式
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", file.display()))
            .map_err(|e| TksError::Internal(format!("Failed to parse SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| TksError::Internal(format!("Failed to connect to SQLite: {e}")))?;

        let backend = Self { pool };
        backend.init().await?;

        info!(
            "SQLite storage initialized with sqlx: path={}, WAL mode enabled",
            file.display()
        );

        Ok(backend)
    }

    async fn classify_consume_failure(&self, id: &str, now: i64) -> TksError {
        match self.get_token(id).await {
            Ok(None) => TksError::TokenNotFound,
            Ok(Some(record)) if now > record.expires_at => TksError::Expired,
            Ok(Some(_)) => TksError::AlreadyConsumed,
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TokenStoreBackend for SqliteBackend {
    async fn init(&self) -> TksResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                issuer_identity TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TksError::Internal(format!("Failed to create tokens table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tokens_expires_at ON tokens(expires_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| TksError::Internal(format!("Failed to create index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_counters (
                identity TEXT NOT NULL,
                window TEXT NOT NULL,
                count INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (identity, window)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TksError::Internal(format!("Failed to create quota table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS grants (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TksError::Internal(format!("Failed to create grants table: {e}")))?;

        debug!("SQLite tables and indexes initialized");
        Ok(())
    }

    async fn insert_token(&self, record: &TokenRecord) -> TksResult<()> {
        sqlx::query(
            r#"INSERT INTO tokens (id, created_at, expires_at, consumed, issuer_identity)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
        )
        .bind(&record.id)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.consumed as i64)
        .bind(&record.issuer_identity)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|d| d.is_unique_violation())
            {
                TksError::DuplicateId
            } else {
                TksError::Database(e)
            }
        })?;

        debug!("Inserted token record: {}", record.id);
        Ok(())
    }

    async fn get_token(&self, id: &str) -> TksResult<Option<TokenRecord>> {
        let row = sqlx::query_as::<_, (String, i64, i64, i64, Option<String>)>(
            "SELECT id, created_at, expires_at, consumed, issuer_identity FROM tokens WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(id, created_at, expires_at, consumed, issuer_identity)| TokenRecord {
                id,
                created_at,
                expires_at,
                consumed: consumed != 0,
                issuer_identity,
            },
        ))
    }

    async fn consume_token(&self, id: &str, now: i64) -> TksResult<()> {
        // 单条条件 UPDATE 即核销的互斥范围：并发核销同一 id 时
        // 恰好一条语句命中，其余走失败分类。
        let result =
            sqlx::query("UPDATE tokens SET consumed = 1 WHERE id = ?1 AND consumed = 0 AND expires_at >= ?2")
                .bind(id)
                .bind(now)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 1 {
            debug!("Token consumed: {}", id);
            Ok(())
        } else {
            Err(self.classify_consume_failure(id, now).await)
        }
    }

    async fn token_count(&self) -> TksResult<u32> {
        let (count,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM tokens")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u32)
    }

    async fn quota_check_and_increment(
        &self,
        identity: &str,
        window: &str,
        limit: u32,
        now: i64,
    ) -> TksResult<bool> {
        if limit == 0 {
            return Ok(false);
        }

        // UPSERT 的 WHERE 守卫使"检查 + 自增"成为单条原子语句；
        // 计数已达上限时语句不命中任何行。
        let result = sqlx::query(
            r#"INSERT INTO quota_counters (identity, window, count, updated_at)
               VALUES (?1, ?2, 1, ?3)
               ON CONFLICT(identity, window) DO UPDATE
               SET count = count + 1, updated_at = excluded.updated_at
               WHERE count < ?4"#,
        )
        .bind(identity)
        .bind(window)
        .bind(now)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn quota_count(&self, identity: &str, window: &str) -> TksResult<u32> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT count FROM quota_counters WHERE identity = ? AND window = ?",
        )
        .bind(identity)
        .bind(window)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(count,)| count as u32).unwrap_or(0))
    }

    async fn insert_grant(&self, record: &GrantRecord) -> TksResult<()> {
        sqlx::query(
            r#"INSERT INTO grants (id, created_at, expires_at, consumed)
               VALUES (?1, ?2, ?3, ?4)"#,
        )
        .bind(&record.id)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.consumed as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|d| d.is_unique_violation())
            {
                TksError::DuplicateId
            } else {
                TksError::Database(e)
            }
        })?;

        debug!("Inserted grant record: {}", record.id);
        Ok(())
    }

    async fn consume_grant(&self, id: &str, now: i64) -> TksResult<()> {
        let result =
            sqlx::query("UPDATE grants SET consumed = 1 WHERE id = ?1 AND consumed = 0 AND expires_at >= ?2")
                .bind(id)
                .bind(now)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 1 {
            debug!("Grant consumed: {}", id);
            Ok(())
        } else {
            // 对外不区分许可失败的细类
            debug!("Grant rejected: {}", id);
            Err(TksError::GrantInvalid)
        }
    }

    async fn cleanup_expired(&self, now: i64) -> TksResult<u32> {
        let tokens = sqlx::query("DELETE FROM tokens WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let grants = sqlx::query("DELETE FROM grants WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let counters = sqlx::query("DELETE FROM quota_counters WHERE updated_at < ?")
            .bind(now - QUOTA_RETENTION_SECS)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let deleted = (tokens + grants + counters) as u32;
        if deleted > 0 {
            debug!(
                "Cleaned up {} expired records ({} tokens, {} grants, {} counters)",
                deleted, tokens, grants, counters
            );
        }

        Ok(deleted)
    }
}
