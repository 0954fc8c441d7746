//! TKS 服务主服务模块

use crate::{
    config::TksServiceConfig,
    engine::TokenEngine,
    error::{TksError, TksResult},
    handlers::{TksState, create_router},
};
use axum::Router;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tracing::info;

/// TKS 服务
///
/// 管理令牌服务的生命周期：配置解析、引擎构建、HTTP 监听。
pub struct TksService {
    config: TksServiceConfig,
    engine: TokenEngine,
}

impl TksService {
    /// 创建新的 TKS 服务实例
    ///
    /// # Arguments
    /// * `config` - TKS 服务配置
    /// * `db_path` - SQLite 数据库存储目录
    pub async fn new(config: TksServiceConfig, db_path: &Path) -> TksResult<Self> {
        info!("Initializing TKS service");

        let engine = TokenEngine::from_config(&config, db_path).await?;

        Ok(Self { config, engine })
    }

    /// 创建 Axum 路由器
    pub fn create_router(&self) -> Router {
        create_router(TksState::new(self.engine.clone()))
    }

    /// 获取引擎引用
    pub fn engine(&self) -> &TokenEngine {
        &self.engine
    }

    /// 启动 TKS 服务
    ///
    /// 绑定地址后阻塞直到服务停止。使用 connect-info 保留
    /// TCP 对端地址，作为未配置 X-Forwarded-For 信任时的身份来源。
    pub async fn start(&self, addr: SocketAddr) -> TksResult<()> {
        info!("Starting TKS service on {}", addr);

        let app = self
            .create_router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TksError::Internal(format!("Failed to bind to {addr}: {e}")))?;

        let actual_addr = listener
            .local_addr()
            .map_err(|e| TksError::Internal(format!("Failed to get local address: {e}")))?;

        info!("TKS service listening on {}", actual_addr);

        axum::serve(listener, app)
            .await
            .map_err(|e| TksError::Internal(format!("Server error: {e}")))?;

        Ok(())
    }

    /// 获取服务统计信息
    pub async fn get_stats(&self) -> TksResult<ServiceStats> {
        let token_count = self.engine.store().token_count().await?;

        Ok(ServiceStats {
            token_count,
            backend: self.engine.store().backend_name(),
            token_ttl_seconds: self.config.token_ttl_seconds,
            grant_gate_enabled: self.config.require_grant,
        })
    }
}

/// 服务统计信息
#[derive(Debug, Clone)]
pub struct ServiceStats {
    /// 令牌总数（含已核销未清理的）
    pub token_count: u32,
    /// 存储后端名称
    pub backend: &'static str,
    /// 令牌有效期
    pub token_ttl_seconds: i64,
    /// 是否启用许可门禁
    pub grant_gate_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TokenEnvelope;
    use tempfile::tempdir;

    fn create_test_config() -> TksServiceConfig {
        TksServiceConfig {
            envelope_key: Some(TokenEnvelope::generate_key()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_service_creation() {
        let temp_dir = tempdir().unwrap();
        let service = TksService::new(create_test_config(), temp_dir.path()).await;
        assert!(service.is_ok());
    }

    #[tokio::test]
    async fn test_service_creation_without_envelope_key_fails() {
        let temp_dir = tempdir().unwrap();
        let result = TksService::new(TksServiceConfig::default(), temp_dir.path()).await;
        assert!(matches!(result, Err(TksError::Config(_))));
    }

    #[tokio::test]
    async fn test_service_stats() {
        let temp_dir = tempdir().unwrap();
        let service = TksService::new(create_test_config(), temp_dir.path())
            .await
            .unwrap();

        let stats = service.get_stats().await.unwrap();
        assert_eq!(stats.token_count, 0);
        assert_eq!(stats.backend, "sqlite");
        assert_eq!(stats.token_ttl_seconds, 86_400);
        assert!(!stats.grant_gate_enabled);
    }

    #[tokio::test]
    async fn test_router_creation() {
        let temp_dir = tempdir().unwrap();
        let service = TksService::new(create_test_config(), temp_dir.path())
            .await
            .unwrap();

        let _router = service.create_router();
    }
}
