//! TKS 服务错误定义

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// TKS 服务错误类型
///
/// 对外暴露的变体各自携带一个稳定的 reason 字符串（见
/// [`TksError::external_reason`]），路由层据此生成响应体；
/// 内部错误统一折叠为 500，不向客户端泄露细节。
#[derive(Error, Debug)]
pub enum TksError {
    /// 验证请求未携带任何输入
    #[error("No key provided")]
    NoInput,

    /// 密文格式错误、被篡改或使用了不同的信封密钥
    #[error("Invalid encrypted key")]
    InvalidEnvelope,

    /// 密钥不存在
    #[error("Key not found")]
    TokenNotFound,

    /// 密钥已被核销
    #[error("Key has already been used")]
    AlreadyConsumed,

    /// 密钥已过期
    #[error("Key expired")]
    Expired,

    /// 申请方在当前窗口内的发放配额已用尽
    #[error("Issuance quota exceeded for {identity}")]
    QuotaExceeded { identity: String },

    /// 启用许可门控后发放请求未携带许可
    #[error("Access grant required")]
    GrantRequired,

    /// 许可不存在、已过期或已被使用
    #[error("Invalid or used grant")]
    GrantInvalid,

    /// 管理接口认证失败
    #[error("Authentication failed")]
    Unauthorized,

    /// 新铸 ID 与存量记录冲突（存储内部信号，引擎有限重试）
    #[error("Duplicate token id")]
    DuplicateId,

    /// 数据库错误
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// 加密/解密错误（非信封格式问题，如密钥初始化失败）
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 内部服务器错误
    #[error("Internal server error: {0}")]
    Internal(String),

    /// JSON 序列化/反序列化错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TksError {
    /// 错误对应的 HTTP 状态码
    pub fn status(&self) -> StatusCode {
        match self {
            TksError::NoInput | TksError::InvalidEnvelope => StatusCode::BAD_REQUEST,
            TksError::TokenNotFound => StatusCode::NOT_FOUND,
            TksError::AlreadyConsumed
            | TksError::Expired
            | TksError::GrantRequired
            | TksError::GrantInvalid => StatusCode::FORBIDDEN,
            TksError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            TksError::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 稳定的对外 reason 字符串
    ///
    /// 内部错误（数据库、加密、配置等）统一返回
    /// "Internal server error"，不暴露细节。
    pub fn external_reason(&self) -> &'static str {
        match self {
            TksError::NoInput => "No key provided",
            TksError::InvalidEnvelope => "Invalid encrypted key",
            TksError::TokenNotFound => "Key not found",
            TksError::AlreadyConsumed => "Key has already been used",
            TksError::Expired => "Key expired",
            TksError::QuotaExceeded { .. } => "Daily key limit reached",
            TksError::GrantRequired => "Access grant required",
            TksError::GrantInvalid => "Invalid or used grant",
            TksError::Unauthorized => "Authentication failed",
            _ => "Internal server error",
        }
    }

    /// 调用方原样重试是否可能成功
    ///
    /// 配额耗尽与过期类错误重试无意义；输入类错误（无输入、
    /// 密文格式错）属于调用方错误，换正确输入重新提交即可。
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TksError::NoInput | TksError::InvalidEnvelope | TksError::Unauthorized
        )
    }
}

impl IntoResponse for TksError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // 不向客户端暴露内部错误详情
            tracing::error!("Internal error: {:?}", self);
        }

        let body = Json(json!({
            "valid": false,
            "reason": self.external_reason(),
        }));

        (status, body).into_response()
    }
}

/// TKS 结果类型别名
pub type TksResult<T> = Result<T, TksError>;
