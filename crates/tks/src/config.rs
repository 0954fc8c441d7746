//! TKS 服务配置

use crate::crypto::SecretSource;
use crate::quota::QuotaConfig;
use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};

/// TKS 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TksServiceConfig {
    /// 存储后端配置
    pub storage: StorageConfig,

    /// 令牌有效期（秒）
    pub token_ttl_seconds: i64,

    /// 颁发配额配置
    pub quota: QuotaConfig,

    /// 信封密钥（直接配置，仅用于开发测试）
    pub envelope_key: Option<String>,
    /// 从环境变量读取信封密钥
    pub envelope_key_env: Option<String>,
    /// 从文件读取信封密钥（优先级最高）
    pub envelope_key_file: Option<String>,

    /// 管理密钥（直接配置，仅用于开发测试）
    pub admin_key: Option<String>,
    /// 从环境变量读取管理密钥
    pub admin_key_env: Option<String>,
    /// 从文件读取管理密钥（优先级最高）
    pub admin_key_file: Option<String>,

    /// 是否要求一次性访问许可才能颁发令牌
    pub require_grant: bool,
    /// 访问许可有效期（秒）
    pub grant_ttl_seconds: i64,

    /// 是否信任 X-Forwarded-For 头作为客户端身份来源
    pub trust_forwarded_for: bool,
}

impl Default for TksServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            token_ttl_seconds: 86_400,
            quota: QuotaConfig::default(),
            envelope_key: None,
            envelope_key_env: None,
            envelope_key_file: None,
            admin_key: None,
            admin_key_env: None,
            admin_key_file: None,
            require_grant: false,
            grant_ttl_seconds: 3_600,
            trust_forwarded_for: false,
        }
    }
}

impl TksServiceConfig {
    /// 解析信封密钥来源，优先级：文件 > 环境变量 > 直接配置
    pub fn envelope_key_source(&self) -> Option<SecretSource> {
        if let Some(path) = &self.envelope_key_file {
            return Some(SecretSource::File(path.clone().into()));
        }
        if let Some(var) = &self.envelope_key_env {
            return Some(SecretSource::Environment(var.clone()));
        }
        self.envelope_key
            .as_ref()
            .map(|key| SecretSource::Direct(key.clone()))
    }

    /// 解析管理密钥来源，优先级与信封密钥相同
    pub fn admin_key_source(&self) -> Option<SecretSource> {
        if let Some(path) = &self.admin_key_file {
            return Some(SecretSource::File(path.clone().into()));
        }
        if let Some(var) = &self.admin_key_env {
            return Some(SecretSource::Environment(var.clone()));
        }
        self.admin_key
            .as_ref()
            .map(|key| SecretSource::Direct(key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TksServiceConfig::default();
        assert_eq!(config.token_ttl_seconds, 86_400);
        assert_eq!(config.grant_ttl_seconds, 3_600);
        assert!(!config.require_grant);
        assert!(!config.trust_forwarded_for);
        assert!(config.envelope_key_source().is_none());
        assert!(config.admin_key_source().is_none());
    }

    #[test]
    fn test_key_source_priority() {
        let config = TksServiceConfig {
            envelope_key: Some("direct".to_string()),
            envelope_key_env: Some("TKS_ENVELOPE_KEY".to_string()),
            envelope_key_file: Some("/run/secrets/envelope".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.envelope_key_source(),
            Some(SecretSource::File(_))
        ));

        let config = TksServiceConfig {
            envelope_key: Some("direct".to_string()),
            envelope_key_env: Some("TKS_ENVELOPE_KEY".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.envelope_key_source(),
            Some(SecretSource::Environment(_))
        ));

        let config = TksServiceConfig {
            admin_key: Some("secret".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.admin_key_source(),
            Some(SecretSource::Direct(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_str = r#"
            token_ttl_seconds = 600
            require_grant = true
            envelope_key_env = "TKS_ENVELOPE_KEY"

            [storage]
            backend = "memory"

            [quota]
            enabled = true
            limit = 2
        "#;
        let config: TksServiceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.token_ttl_seconds, 600);
        assert!(config.require_grant);
        assert_eq!(config.quota.limit, 2);
        assert_eq!(config.storage.backend, crate::storage::StorageBackend::Memory);
    }
}
