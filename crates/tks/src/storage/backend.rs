//! 密钥存储后端抽象接口
//!
//! 定义了所有存储后端必须实现的统一异步接口。
//! 密钥记录、配额计数器、访问许可是进程内唯一的共享可变状态，
//! 全部经由本接口的原子操作读写。

use crate::error::TksResult;
use crate::types::{GrantRecord, TokenRecord};
use async_trait::async_trait;

/// 密钥存储后端抽象接口
///
/// 所有存储后端（SQLite、内存）都需要实现此 trait。
#[async_trait]
pub trait TokenStoreBackend: Send + Sync {
    /// 初始化存储后端
    ///
    /// 执行必要的初始化操作，如创建表、索引等
    async fn init(&self) -> TksResult<()>;

    /// 插入新的密钥记录
    ///
    /// # Errors
    /// * [`TksError::DuplicateId`](crate::TksError::DuplicateId) - `id` 已存在，
    ///   调用方应换新 ID 重试
    async fn insert_token(&self, record: &TokenRecord) -> TksResult<()>;

    /// 查询密钥记录，无副作用
    async fn get_token(&self, id: &str) -> TksResult<Option<TokenRecord>>;

    /// 原子核销
    ///
    /// 在单个互斥范围内完成"读取 -> 检查 -> 置位"。对同一 `id` 的
    /// 并发调用是线性化的：恰好一个成功，其余失败。
    ///
    /// 失败分类（按检查顺序）：
    /// * `TokenNotFound` - 记录不存在
    /// * `Expired` - `now > expires_at`（无论是否已核销）
    /// * `AlreadyConsumed` - 已被核销
    async fn consume_token(&self, id: &str, now: i64) -> TksResult<()>;

    /// 获取密钥记录总数（包括过期和已核销的）
    async fn token_count(&self) -> TksResult<u32>;

    /// 配额检查并自增
    ///
    /// 若 `(identity, window)` 的计数已达 `limit` 则不做任何修改并
    /// 返回 `Ok(false)`；否则原子自增并返回 `Ok(true)`。
    /// "检查 + 自增"对同一身份是原子的，两个并发请求不可能都在
    /// `count == limit - 1` 时通过。
    async fn quota_check_and_increment(
        &self,
        identity: &str,
        window: &str,
        limit: u32,
        now: i64,
    ) -> TksResult<bool>;

    /// 查询配额计数（测试与统计用）
    async fn quota_count(&self, identity: &str, window: &str) -> TksResult<u32>;

    /// 插入新的访问许可
    async fn insert_grant(&self, record: &GrantRecord) -> TksResult<()>;

    /// 原子核销访问许可
    ///
    /// 与 [`consume_token`](Self::consume_token) 同样的恰好一次保证；
    /// 不存在、过期、已使用统一归为
    /// [`GrantInvalid`](crate::TksError::GrantInvalid)。
    async fn consume_grant(&self, id: &str, now: i64) -> TksResult<()>;

    /// 清理过期记录
    ///
    /// 删除已过期的密钥与许可，以及长期未更新的配额计数。
    /// 仅为空间优化；过期在读取时判定，正确性不依赖清理。
    ///
    /// # Returns
    /// 被删除的记录数
    async fn cleanup_expired(&self, now: i64) -> TksResult<u32>;
}
