//! 内存存储后端实现
//!
//! 用于测试和无持久化需求的场景。进程退出后所有记录丢失。
//!
//! 所有"检查 + 变更"操作都在单次写锁临界区内完成，
//! 与 SQLite 后端的单条条件语句等价。

use crate::error::{TksError, TksResult};
use crate::storage::backend::TokenStoreBackend;
use crate::storage::QUOTA_RETENTION_SECS;
use crate::types::{GrantRecord, TokenRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct QuotaEntry {
    count: u32,
    updated_at: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    tokens: HashMap<String, TokenRecord>,
    quota: HashMap<(String, String), QuotaEntry>,
    grants: HashMap<String, GrantRecord>,
}

/// 内存存储后端
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStoreBackend for MemoryBackend {
    async fn init(&self) -> TksResult<()> {
        Ok(())
    }

    async fn insert_token(&self, record: &TokenRecord) -> TksResult<()> {
        let mut state = self.state.write().await;
        if state.tokens.contains_key(&record.id) {
            return Err(TksError::DuplicateId);
        }
        state.tokens.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_token(&self, id: &str) -> TksResult<Option<TokenRecord>> {
        let state = self.state.read().await;
        Ok(state.tokens.get(id).cloned())
    }

    async fn consume_token(&self, id: &str, now: i64) -> TksResult<()> {
        let mut state = self.state.write().await;
        let record = state.tokens.get_mut(id).ok_or(TksError::TokenNotFound)?;
        if now > record.expires_at {
            return Err(TksError::Expired);
        }
        if record.consumed {
            return Err(TksError::AlreadyConsumed);
        }
        record.consumed = true;
        debug!("Token consumed: {}", id);
        Ok(())
    }

    async fn token_count(&self) -> TksResult<u32> {
        let state = self.state.read().await;
        Ok(state.tokens.len() as u32)
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

        let mut state = self.state.write().await;
        let entry = state
            .quota
            .entry((identity.to_string(), window.to_string()))
            .or_insert(QuotaEntry {
                count: 0,
                updated_at: now,
            });
        if entry.count >= limit {
            return Ok(false);
        }
        entry.count += 1;
        entry.updated_at = now;
        Ok(true)
    }

    async fn quota_count(&self, identity: &str, window: &str) -> TksResult<u32> {
        let state = self.state.read().await;
        Ok(state
            .quota
            .get(&(identity.to_string(), window.to_string()))
            .map(|entry| entry.count)
            .unwrap_or(0))
    }

    async fn insert_grant(&self, record: &GrantRecord) -> TksResult<()> {
        let mut state = self.state.write().await;
        if state.grants.contains_key(&record.id) {
            return Err(TksError::DuplicateId);
        }
        state.grants.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn consume_grant(&self, id: &str, now: i64) -> TksResult<()> {
        let mut state = self.state.write().await;
        let record = state.grants.get_mut(id).ok_or(TksError::GrantInvalid)?;
        if record.consumed || now > record.expires_at {
            return Err(TksError::GrantInvalid);
        }
        record.consumed = true;
        debug!("Grant consumed: {}", id);
        Ok(())
    }

    async fn cleanup_expired(&self, now: i64) -> TksResult<u32> {
        let mut state = self.state.write().await;
        let before = state.tokens.len() + state.grants.len() + state.quota.len();

        state.tokens.retain(|_, record| record.expires_at >= now);
        state.grants.retain(|_, record| record.expires_at >= now);
        state
            .quota
            .retain(|_, entry| entry.updated_at >= now - QUOTA_RETENTION_SECS);

        let after = state.tokens.len() + state.grants.len() + state.quota.len();
        Ok((before - after) as u32)
    }
}
