//! TKS 服务数据类型定义

use serde::{Deserialize, Serialize};

/// 存储中的访问密钥记录
///
/// `id` 为明文 UUID，仅存在于存储与引擎内部；
/// 对外永远只暴露信封加密后的密文。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// 明文密钥 ID（UUID v4）
    pub id: String,
    /// 创建时间（Unix 秒，UTC）
    pub created_at: i64,
    /// 过期时间（Unix 秒，UTC）
    pub expires_at: i64,
    /// 是否已被核销；false -> true 只发生一次
    pub consumed: bool,
    /// 申请方身份（IP 地址），仅用于配额统计，核销时不需要
    pub issuer_identity: Option<String>,
}

/// 一次性访问许可记录（可选的上游发放门控）
///
/// 许可与访问密钥共用同一套"恰好核销一次"的存储原语，
/// 但生命周期彼此独立。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRecord {
    /// 许可 ID（UUID v4，明文分发给上游）
    pub id: String,
    /// 创建时间（Unix 秒，UTC）
    pub created_at: i64,
    /// 过期时间（Unix 秒，UTC）
    pub expires_at: i64,
    /// 是否已被使用
    pub consumed: bool,
}

/// 发放成功后返回给调用方的密钥信息
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// 信封加密后的密钥密文
    pub key: String,
    /// 过期时间（Unix 秒）
    pub expires_at: i64,
}

/// `GET /genkey` 查询参数
#[derive(Debug, Default, Deserialize)]
pub struct IssueParams {
    /// 一次性访问许可 ID（启用许可门控时必须携带）
    pub grant: Option<String>,
}

/// `GET /genkey` 响应
#[derive(Debug, Serialize, Deserialize)]
pub struct IssueResponse {
    /// 信封加密后的密钥密文
    pub key: String,
    /// 过期时间（Unix 秒）
    pub expires: i64,
    pub valid: bool,
}

/// `GET /verify` 查询参数
///
/// 客户端可以用 `key` 或 `token` 两个名字之一携带密文。
#[derive(Debug, Default, Deserialize)]
pub struct VerifyParams {
    pub key: Option<String>,
    pub token: Option<String>,
}

impl VerifyParams {
    /// 取出待验证输入，`key` 优先；空字符串视同缺失
    pub fn input(&self) -> Option<&str> {
        self.key
            .as_deref()
            .or(self.token.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// `GET /verify` 响应
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub reason: String,
}

/// `POST /grant` 响应
#[derive(Debug, Serialize, Deserialize)]
pub struct GrantResponse {
    /// 许可 ID（明文）
    pub grant: String,
    /// 过期时间（Unix 秒）
    pub expires: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_params_key_takes_precedence() {
        let params = VerifyParams {
            key: Some("a".to_string()),
            token: Some("b".to_string()),
        };
        assert_eq!(params.input(), Some("a"));
    }

    #[test]
    fn test_verify_params_token_fallback() {
        let params = VerifyParams {
            key: None,
            token: Some("b".to_string()),
        };
        assert_eq!(params.input(), Some("b"));
    }

    #[test]
    fn test_verify_params_empty_is_missing() {
        let params = VerifyParams {
            key: Some("   ".to_string()),
            token: None,
        };
        assert_eq!(params.input(), None);

        let params = VerifyParams::default();
        assert_eq!(params.input(), None);
    }
}
