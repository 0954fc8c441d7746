//! 令牌生命周期引擎
//!
//! 串联信封加密、配额跟踪与存储层，实现颁发与核销两条主路径。
//! 所有时间判断都基于调用方传入的 UTC 秒级时间戳，引擎本身不读时钟。

use crate::config::TksServiceConfig;
use crate::crypto::TokenEnvelope;
use crate::error::{TksError, TksResult};
use crate::quota::QuotaTracker;
use crate::storage::TokenStore;
use crate::types::{GrantRecord, IssuedToken, TokenRecord};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// DuplicateId 冲突时的最大重铸次数
const MAX_MINT_ATTEMPTS: u32 = 3;

/// 每处理多少次请求触发一次惰性清理
const CLEANUP_INTERVAL_REQUESTS: u32 = 100;

/// 存储记录数低于该值时跳过清理
const CLEANUP_MIN_RECORDS: u32 = 10;

/// 核销成功的两种形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// 普通令牌被核销，此后不可再用
    Consumed,
    /// 管理密钥直通，不触碰任何存储状态
    AdminBypass,
}

/// 令牌生命周期引擎
#[derive(Clone)]
pub struct TokenEngine {
    store: TokenStore,
    envelope: Arc<TokenEnvelope>,
    quota: QuotaTracker,
    admin_key: Option<String>,
    token_ttl: i64,
    require_grant: bool,
    grant_ttl: i64,
    trust_forwarded_for: bool,
    request_counter: Arc<AtomicU32>,
}

impl std::fmt::Debug for TokenEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEngine")
            .field("backend", &self.store.backend_name())
            .field("token_ttl", &self.token_ttl)
            .field("require_grant", &self.require_grant)
            .finish_non_exhaustive()
    }
}

impl TokenEngine {
    /// 根据配置构建引擎。信封密钥是必需配置，缺失即拒绝启动。
    pub async fn from_config(config: &TksServiceConfig, db_path: &Path) -> TksResult<Self> {
        let source = config.envelope_key_source().ok_or_else(|| {
            TksError::Config(
                "Envelope key is required: set envelope_key_file, envelope_key_env or envelope_key"
                    .to_string(),
            )
        })?;
        let envelope = TokenEnvelope::from_source(&source)?;

        let admin_key = match config.admin_key_source() {
            Some(source) => {
                let key = source.load()?;
                if key.is_empty() {
                    return Err(TksError::Config("Admin key is empty".to_string()));
                }
                Some(key)
            }
            None => None,
        };

        if config.require_grant && admin_key.is_none() {
            return Err(TksError::Config(
                "require_grant is enabled but no admin key is configured".to_string(),
            ));
        }

        let store = TokenStore::from_config(&config.storage, db_path).await?;

        info!(
            "Token engine initialized: backend={}, ttl={}s, quota_limit={}, grant_gate={}",
            store.backend_name(),
            config.token_ttl_seconds,
            config.quota.limit,
            config.require_grant
        );

        Ok(Self {
            store,
            envelope: Arc::new(envelope),
            quota: QuotaTracker::new(config.quota.clone()),
            admin_key,
            token_ttl: config.token_ttl_seconds,
            require_grant: config.require_grant,
            grant_ttl: config.grant_ttl_seconds,
            trust_forwarded_for: config.trust_forwarded_for,
            request_counter: Arc::new(AtomicU32::new(0)),
        })
    }

    /// 颁发一枚新令牌
    ///
    /// 顺序固定：许可在场检查（不变更状态）、配额占用、许可核销、铸造。
    /// 任何一步失败都不会留下可用的半成品令牌。
    pub async fn issue(
        &self,
        identity: &str,
        grant: Option<&str>,
        now: i64,
    ) -> TksResult<IssuedToken> {
        if self.require_grant && grant.is_none() {
            return Err(TksError::GrantRequired);
        }

        self.quota.check_and_increment(&self.store, identity, now).await?;

        if self.require_grant {
            // grant.is_some() 已由在场检查保证
            if let Some(grant_id) = grant {
                self.store.consume_grant(grant_id, now).await?;
            }
        }

        let token = self.mint(identity, now).await?;
        info!("Token issued: identity={}, expires_at={}", identity, token.expires_at);
        Ok(token)
    }

    /// 铸造：先加密后落库，确保存储里只有可被核销的令牌
    async fn mint(&self, identity: &str, now: i64) -> TksResult<IssuedToken> {
        let expires_at = now + self.token_ttl;

        for attempt in 1..=MAX_MINT_ATTEMPTS {
            let id = Uuid::new_v4().to_string();
            let key = self.envelope.encrypt(&id)?;

            let record = TokenRecord {
                id,
                created_at: now,
                expires_at,
                consumed: false,
                issuer_identity: Some(identity.to_string()),
            };

            match self.store.insert_token(&record).await {
                Ok(()) => return Ok(IssuedToken { key, expires_at }),
                Err(TksError::DuplicateId) => {
                    warn!("Token id collision on attempt {}, regenerating", attempt);
                }
                Err(e) => return Err(e),
            }
        }

        Err(TksError::Internal(format!(
            "Failed to mint a unique token id after {MAX_MINT_ATTEMPTS} attempts"
        )))
    }

    /// 核销令牌或识别管理密钥
    ///
    /// 管理密钥在解密前后各比对一次：明文直通和密文包裹都可用。
    pub async fn verify(&self, input: &str, now: i64) -> TksResult<VerifyOutcome> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TksError::NoInput);
        }

        if self.is_admin_key(input) {
            info!("Admin key accepted (plaintext)");
            return Ok(VerifyOutcome::AdminBypass);
        }

        let id = self.envelope.decrypt(input)?;

        if self.is_admin_key(&id) {
            info!("Admin key accepted (enveloped)");
            return Ok(VerifyOutcome::AdminBypass);
        }

        self.store.consume_token(&id, now).await?;
        debug!("Token verified and consumed: {}", id);
        Ok(VerifyOutcome::Consumed)
    }

    /// 铸造一枚一次性访问许可
    pub async fn mint_grant(&self, now: i64) -> TksResult<GrantRecord> {
        let record = GrantRecord {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            expires_at: now + self.grant_ttl,
            consumed: false,
        };
        self.store.insert_grant(&record).await?;
        info!("Grant issued: expires_at={}", record.expires_at);
        Ok(record)
    }

    /// 惰性清理：每 CLEANUP_INTERVAL_REQUESTS 次请求触发一次，
    /// 在后台任务里删除过期记录，不阻塞当前请求。
    pub fn maybe_cleanup(&self, now: i64) {
        let count = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count % CLEANUP_INTERVAL_REQUESTS != 0 {
            return;
        }

        let store = self.store.clone();
        tokio::spawn(async move {
            match store.token_count().await {
                Ok(total) if total >= CLEANUP_MIN_RECORDS => {
                    match store.cleanup_expired(now).await {
                        Ok(deleted) if deleted > 0 => {
                            info!("Lazy cleanup removed {} expired records", deleted);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Lazy cleanup failed: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Lazy cleanup skipped, count query failed: {}", e),
            }
        });
    }

    pub fn is_admin_key(&self, candidate: &str) -> bool {
        self.admin_key.as_deref() == Some(candidate) && !candidate.is_empty()
    }

    pub fn grant_gate_enabled(&self) -> bool {
        self.require_grant
    }

    pub fn trust_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TokenEnvelope;
    use crate::quota::{QuotaConfig, QuotaWindow};
    use crate::storage::{StorageBackend, StorageConfig};

    fn test_config() -> TksServiceConfig {
        TksServiceConfig {
            storage: StorageConfig {
                backend: StorageBackend::Memory,
            },
            envelope_key: Some(TokenEnvelope::generate_key()),
            ..Default::default()
        }
    }

    async fn engine(config: TksServiceConfig) -> TokenEngine {
        TokenEngine::from_config(&config, Path::new("/unused"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_issue_then_verify_once() {
        let engine = engine(test_config()).await;
        let now = 1_717_200_000;

        let token = engine.issue("10.0.0.1", None, now).await.unwrap();
        assert_eq!(token.expires_at, now + 86_400);

        let outcome = engine.verify(&token.key, now + 10).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Consumed);

        let result = engine.verify(&token.key, now + 20).await;
        assert!(matches!(result, Err(TksError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn test_verify_rejects_bad_input() {
        let engine = engine(test_config()).await;

        assert!(matches!(engine.verify("", 0).await, Err(TksError::NoInput)));
        assert!(matches!(engine.verify("   ", 0).await, Err(TksError::NoInput)));
        assert!(matches!(
            engine.verify("not-an-envelope", 0).await,
            Err(TksError::InvalidEnvelope)
        ));
    }

    #[tokio::test]
    async fn test_verify_unknown_but_wellformed_envelope() {
        let engine = engine(test_config()).await;

        // 用同一把密钥加密一个从未颁发过的 id
        let key = engine.envelope.encrypt("never-issued").unwrap();
        let result = engine.verify(&key, 0).await;
        assert!(matches!(result, Err(TksError::TokenNotFound)));
    }

    #[tokio::test]
    async fn test_verify_expired_token() {
        let engine = engine(test_config()).await;
        let now = 1_717_200_000;

        let token = engine.issue("10.0.0.1", None, now).await.unwrap();

        // 恰好到期的时刻仍然有效
        let fresh = engine.issue("10.0.0.1", None, now).await.unwrap();
        engine.verify(&fresh.key, now + 86_400).await.unwrap();

        let result = engine.verify(&token.key, now + 86_401).await;
        assert!(matches!(result, Err(TksError::Expired)));
    }

    #[tokio::test]
    async fn test_quota_exhaustion_then_window_rollover() {
        let mut config = test_config();
        config.quota = QuotaConfig {
            enabled: true,
            limit: 2,
            window: QuotaWindow::CalendarDay,
        };
        let engine = engine(config).await;
        let now = 1_717_200_000;

        engine.issue("10.0.0.1", None, now).await.unwrap();
        engine.issue("10.0.0.1", None, now).await.unwrap();

        let count_before = engine.store().token_count().await.unwrap();
        let result = engine.issue("10.0.0.1", None, now).await;
        assert!(matches!(result, Err(TksError::QuotaExceeded { .. })));

        // 被配额拒绝的请求不留下任何令牌记录
        assert_eq!(engine.store().token_count().await.unwrap(), count_before);

        // 其他身份不受影响
        engine.issue("10.0.0.2", None, now).await.unwrap();

        // 窗口翻转后重新放行
        engine.issue("10.0.0.1", None, now + 86_400).await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_bypass_plaintext_and_enveloped() {
        let mut config = test_config();
        config.admin_key = Some("master-secret".to_string());
        let engine = engine(config).await;

        // 明文直通，可重复使用，不消耗任何状态
        for _ in 0..3 {
            let outcome = engine.verify("master-secret", 0).await.unwrap();
            assert_eq!(outcome, VerifyOutcome::AdminBypass);
        }

        // 密文包裹的管理密钥同样直通
        let wrapped = engine.envelope.encrypt("master-secret").unwrap();
        let outcome = engine.verify(&wrapped, 0).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::AdminBypass);

        // 管理密钥直通不读写令牌存储
        assert_eq!(engine.store().token_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_grant_gate() {
        let mut config = test_config();
        config.require_grant = true;
        config.admin_key = Some("admin".to_string());
        let engine = engine(config).await;
        let now = 1_717_200_000;

        // 无许可拒绝
        let result = engine.issue("10.0.0.1", None, now).await;
        assert!(matches!(result, Err(TksError::GrantRequired)));

        // 有效许可放行，且许可一次性
        let grant = engine.mint_grant(now).await.unwrap();
        assert_eq!(grant.expires_at, now + 3_600);
        engine.issue("10.0.0.1", Some(&grant.id), now).await.unwrap();

        let result = engine.issue("10.0.0.1", Some(&grant.id), now).await;
        assert!(matches!(result, Err(TksError::GrantInvalid)));

        // 伪造与过期的许可一律拒绝
        let result = engine.issue("10.0.0.1", Some("forged"), now).await;
        assert!(matches!(result, Err(TksError::GrantInvalid)));

        let stale = engine.mint_grant(now).await.unwrap();
        let result = engine
            .issue("10.0.0.1", Some(&stale.id), now + 3_601)
            .await;
        assert!(matches!(result, Err(TksError::GrantInvalid)));
    }

    #[tokio::test]
    async fn test_quota_checked_before_grant_consumed() {
        let mut config = test_config();
        config.require_grant = true;
        config.admin_key = Some("admin".to_string());
        config.quota = QuotaConfig {
            enabled: true,
            limit: 1,
            window: QuotaWindow::CalendarDay,
        };
        let engine = engine(config).await;
        let now = 1_717_200_000;

        let first = engine.mint_grant(now).await.unwrap();
        engine.issue("10.0.0.1", Some(&first.id), now).await.unwrap();

        // 配额先于许可核销：被配额拒绝的请求不烧掉许可
        let second = engine.mint_grant(now).await.unwrap();
        let result = engine.issue("10.0.0.1", Some(&second.id), now).await;
        assert!(matches!(result, Err(TksError::QuotaExceeded { .. })));

        engine
            .issue("10.0.0.1", Some(&second.id), now + 86_400)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_verify_single_consumption() {
        let engine = engine(test_config()).await;
        let now = 1_717_200_000;
        let token = engine.issue("10.0.0.1", None, now).await.unwrap();

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let engine = engine.clone();
            let key = token.key.clone();
            set.spawn(async move { engine.verify(&key, now).await });
        }

        let mut consumed = 0;
        let mut already = 0;
        while let Some(result) = set.join_next().await {
            match result.unwrap() {
                Ok(VerifyOutcome::Consumed) => consumed += 1,
                Err(TksError::AlreadyConsumed) => already += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(consumed, 1);
        assert_eq!(already, 7);
    }

    #[tokio::test]
    async fn test_engine_requires_envelope_key() {
        let config = TksServiceConfig {
            storage: StorageConfig {
                backend: StorageBackend::Memory,
            },
            ..Default::default()
        };
        let result = TokenEngine::from_config(&config, Path::new("/unused")).await;
        assert!(matches!(result, Err(TksError::Config(_))));
    }

    #[tokio::test]
    async fn test_grant_gate_requires_admin_key() {
        let mut config = test_config();
        config.require_grant = true;
        let result = TokenEngine::from_config(&config, Path::new("/unused")).await;
        assert!(matches!(result, Err(TksError::Config(_))));
    }
}
