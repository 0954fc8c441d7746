//! Token Key Service (TKS) - 一次性访问密钥的颁发与核销服务
//!
//! TKS 服务提供以下功能：
//! 1. 颁发限时一次性访问令牌（AES-256-GCM 信封加密的不透明票据）
//! 2. 核销令牌：原子的检查并消费，同一令牌恰好成功一次
//! 3. 按客户端身份的颁发配额（自然日或滚动窗口）
//! 4. 管理密钥直通与一次性访问许可门禁
//! 5. 多存储后端支持：SQLite、内存

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod quota;
pub mod service;
pub mod storage;
pub mod types;

// Re-export commonly used items
pub use config::TksServiceConfig;
pub use crypto::{SecretSource, TokenEnvelope};
pub use engine::{TokenEngine, VerifyOutcome};
pub use error::{TksError, TksResult};
pub use handlers::{ClientIp, TksState, create_router, register_tks_metrics};
pub use quota::{QuotaConfig, QuotaTracker, QuotaWindow};
pub use service::{ServiceStats, TksService};
pub use storage::{StorageConfig, TokenStore};
pub use types::{
    GrantRecord, GrantResponse, IssueParams, IssueResponse, IssuedToken, TokenRecord,
    VerifyParams, VerifyResponse,
};
