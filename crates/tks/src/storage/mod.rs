//! TKS 存储抽象层
//!
//! 令牌、配额计数与访问许可共用同一个存储实例，
//! 通过枚举分发支持多种后端（SQLite、内存）。

pub mod backend;
pub mod config;
pub mod memory;
pub mod sqlite;

pub use backend::TokenStoreBackend;
pub use config::{StorageBackend, StorageConfig};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use crate::error::TksResult;
use crate::types::{GrantRecord, TokenRecord};
use std::path::Path;

/// 配额计数器的保留时长（秒）：窗口关闭两天后即可回收
pub const QUOTA_RETENTION_SECS: i64 = 172_800;

/// 统一的令牌存储接口（枚举分发）
#[derive(Debug, Clone)]
pub enum TokenStore {
    Sqlite(Box<SqliteBackend>),
    Memory(MemoryBackend),
}

impl TokenStore {
    /// 根据配置创建存储实例
    pub async fn from_config(config: &StorageConfig, db_path: &Path) -> TksResult<Self> {
        match config.backend {
            StorageBackend::Sqlite => {
                let backend = SqliteBackend::new(db_path).await?;
                Ok(TokenStore::Sqlite(Box::new(backend)))
            }
            StorageBackend::Memory => Ok(TokenStore::Memory(MemoryBackend::new())),
        }
    }

    /// 后端名称，用于日志与统计
    pub fn backend_name(&self) -> &'static str {
        match self {
            TokenStore::Sqlite(_) => "sqlite",
            TokenStore::Memory(_) => "memory",
        }
    }

    pub async fn insert_token(&self, record: &TokenRecord) -> TksResult<()> {
        match self {
            TokenStore::Sqlite(b) => b.insert_token(record).await,
            TokenStore::Memory(b) => b.insert_token(record).await,
        }
    }

    pub async fn get_token(&self, id: &str) -> TksResult<Option<TokenRecord>> {
        match self {
            TokenStore::Sqlite(b) => b.get_token(id).await,
            TokenStore::Memory(b) => b.get_token(id).await,
        }
    }

    pub async fn consume_token(&self, id: &str, now: i64) -> TksResult<()> {
        match self {
            TokenStore::Sqlite(b) => b.consume_token(id, now).await,
            TokenStore::Memory(b) => b.consume_token(id, now).await,
        }
    }

    pub async fn token_count(&self) -> TksResult<u32> {
        match self {
            TokenStore::Sqlite(b) => b.token_count().await,
            TokenStore::Memory(b) => b.token_count().await,
        }
    }

    pub async fn quota_check_and_increment(
        &self,
        identity: &str,
        window: &str,
        limit: u32,
        now: i64,
    ) -> TksResult<bool> {
        match self {
            TokenStore::Sqlite(b) => {
                b.quota_check_and_increment(identity, window, limit, now)
                    .await
            }
            TokenStore::Memory(b) => {
                b.quota_check_and_increment(identity, window, limit, now)
                    .await
            }
        }
    }

    pub async fn quota_count(&self, identity: &str, window: &str) -> TksResult<u32> {
        match self {
            TokenStore::Sqlite(b) => b.quota_count(identity, window).await,
            TokenStore::Memory(b) => b.quota_count(identity, window).await,
        }
    }

    pub async fn insert_grant(&self, record: &GrantRecord) -> TksResult<()> {
        match self {
            TokenStore::Sqlite(b) => b.insert_grant(record).await,
            TokenStore::Memory(b) => b.insert_grant(record).await,
        }
    }

    pub async fn consume_grant(&self, id: &str, now: i64) -> TksResult<()> {
        match self {
            TokenStore::Sqlite(b) => b.consume_grant(id, now).await,
            TokenStore::Memory(b) => b.consume_grant(id, now).await,
        }
    }

    pub async fn cleanup_expired(&self, now: i64) -> TksResult<u32> {
        match self {
            TokenStore::Sqlite(b) => b.cleanup_expired(now).await,
            TokenStore::Memory(b) => b.cleanup_expired(now).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_memory() {
        let config = StorageConfig {
            backend: StorageBackend::Memory,
        };
        let store = TokenStore::from_config(&config, Path::new("/nonexistent"))
            .await
            .unwrap();
        assert_eq!(store.backend_name(), "memory");
        assert_eq!(store.token_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Sqlite,
        };
        let store = TokenStore::from_config(&config, temp_dir.path())
            .await
            .unwrap();
        assert_eq!(store.backend_name(), "sqlite");
        assert_eq!(store.token_count().await.unwrap(), 0);
    }
}
