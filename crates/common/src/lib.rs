//! Keygate 基础设施库
//!
//! 为 Keygate 令牌服务提供通用组件：配置管理与监控指标

pub mod config;
pub mod metrics;

// Re-export commonly used types for convenience
pub use config::{KeygateConfig, LogConfig, ObservabilityConfig};
pub use metrics::{REGISTRY, RequestTimer, export_metrics, register_metrics};
