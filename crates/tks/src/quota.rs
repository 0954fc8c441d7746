//! 按身份限制颁发频率的配额跟踪器
//!
//! 每个身份在每个时间窗口内最多颁发固定数量的令牌。
//! 窗口键是纯函数计算的字符串，计数的检查与自增由存储层
//! 在单个原子操作内完成。

use crate::error::{TksError, TksResult};
use crate::storage::TokenStore;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 配额时间窗口类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaWindow {
    /// UTC 自然日窗口（00:00:00 翻转）
    CalendarDay,
    /// 固定长度滚动窗口
    Rolling { seconds: i64 },
}

impl Default for QuotaWindow {
    fn default() -> Self {
        QuotaWindow::CalendarDay
    }
}

impl QuotaWindow {
    /// 计算时间戳所属窗口的键。相同窗口内的所有时刻映射到同一个键。
    pub fn window_key(&self, now: i64) -> String {
        match self {
            QuotaWindow::CalendarDay => match Utc.timestamp_opt(now, 0).single() {
                Some(dt) => dt.format("%Y-%m-%d").to_string(),
                // 时间戳超出 chrono 可表示范围时退化为数值日编号
                None => format!("day-{}", now.div_euclid(86_400)),
            },
            QuotaWindow::Rolling { seconds } => {
                let seconds = (*seconds).max(1);
                format!("r{}", now - now.rem_euclid(seconds))
            }
        }
    }
}

/// 配额配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// 是否启用配额限制
    pub enabled: bool,
    /// 每个窗口内每个身份的最大颁发数
    pub limit: u32,
    /// 窗口类型
    pub window: QuotaWindow,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 4,
            window: QuotaWindow::CalendarDay,
        }
    }
}

/// 配额跟踪器
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    config: QuotaConfig,
}

impl QuotaTracker {
    pub fn new(config: QuotaConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn limit(&self) -> u32 {
        self.config.limit
    }

    /// 检查当前窗口配额并占用一个名额
    ///
    /// 配额未启用时直接放行。名额耗尽时返回 QuotaExceeded，
    /// 且不产生任何计数变更。
    pub async fn check_and_increment(
        &self,
        store: &TokenStore,
        identity: &str,
        now: i64,
    ) -> TksResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let window = self.config.window.window_key(now);
        let allowed = store
            .quota_check_and_increment(identity, &window, self.config.limit, now)
            .await?;

        if allowed {
            debug!("Quota slot taken: identity={}, window={}", identity, window);
            Ok(())
        } else {
            debug!(
                "Quota exhausted: identity={}, window={}, limit={}",
                identity, window, self.config.limit
            );
            Err(TksError::QuotaExceeded {
                identity: identity.to_string(),
            })
        }
    }

    /// 当前窗口已用名额数（统计用）
    pub async fn current_count(
        &self,
        store: &TokenStore,
        identity: &str,
        now: i64,
    ) -> TksResult<u32> {
        let window = self.config.window.window_key(now);
        store.quota_count(identity, &window).await
    }
}
