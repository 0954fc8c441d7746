//! Keygate 主程序
//!
//! 启动和管理一次性访问密钥服务：HTTP 监听、配置加载、进程管理

mod cli;
mod error;
mod observability;
mod process;

use axum::{Router, routing::get};
use clap::Parser;
use keygate_common::config::KeygateConfig;
use observability::init_observability;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tks::TksService;
use tracing::{error, info, warn};

macro_rules! bootstrap_info {
    ($($arg:tt)*) => {
        println!($($arg)*);
    };
}

macro_rules! bootstrap_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

use cli::{Cli, Commands};
use error::{Error, Result};

/// Application launcher utilities
struct ApplicationLauncher;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Test { config_file }) => {
            let config_path =
                ApplicationLauncher::find_config_file(config_file.as_ref().unwrap_or(&cli.config))?;
            ApplicationLauncher::test_config_file(&config_path)
        }
        None => {
            let config_path = ApplicationLauncher::find_config_file(&cli.config)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;

            runtime.block_on(ApplicationLauncher::run_application(&config_path))
        }
    }
}

impl ApplicationLauncher {
    /// Find config file with fallback locations
    fn find_config_file(provided_path: &PathBuf) -> Result<PathBuf> {
        // If the provided path is not the default "config.toml", check if it exists
        if provided_path != Path::new("config.toml") {
            if provided_path.exists() {
                bootstrap_info!("Using provided config file: {:?}", provided_path);
                return Ok(provided_path.clone());
            } else {
                bootstrap_error!("Provided config file not found: {:?}", provided_path);
                return Err(Error::custom(format!(
                    "Config file not found: {provided_path:?}"
                )));
            }
        }

        // Otherwise, try fallback locations
        let fallback_paths = vec![
            // 1. Current working directory
            PathBuf::from("config.toml"),
            // 2. System config directory
            PathBuf::from("/etc/keygate/config.toml"),
        ];

        bootstrap_info!("Searching for config file in default locations...");

        for path in &fallback_paths {
            if path.exists() {
                bootstrap_info!("Found config file: {:?}", path);
                return Ok(path.clone());
            } else {
                bootstrap_info!("Config not found at: {:?}", path);
            }
        }

        bootstrap_error!("No configuration file found!");
        bootstrap_error!("Please create a config file in one of these locations:");
        for (i, path) in fallback_paths.iter().enumerate() {
            bootstrap_error!("  {}. {:?}", i + 1, path);
        }
        bootstrap_error!("Or specify a custom path with: keygate --config <path>");

        Err(Error::custom(
            "No configuration file found. Please create one or specify path with --config",
        ))
    }

    /// 测试配置文件是否有效
    fn test_config_file(config_path: &PathBuf) -> Result<()> {
        // Initialize basic logging for test command
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();

        match KeygateConfig::from_file(config_path) {
            Ok(config) => {
                info!("✅ 配置文件解析成功: {:?}", config_path);

                match config.validate() {
                    Ok(()) => {
                        info!("✅ 配置验证通过");
                    }
                    Err(errors) => {
                        error!("❌ 配置验证发现问题:");
                        for (i, err) in errors.iter().enumerate() {
                            if err.starts_with("Warning:") {
                                info!("  {}. ⚠️  {}", i + 1, err);
                            } else {
                                error!("  {}. ❌ {}", i + 1, err);
                            }
                        }
                        let has_errors = errors.iter().any(|e| !e.starts_with("Warning:"));
                        if has_errors {
                            return Err(Error::service_validation("配置验证失败".to_string()));
                        }
                    }
                }

                info!("✅ 完整配置验证通过");
                Ok(())
            }
            Err(e) => {
                error!("❌ 配置文件解析失败: {}", e);
                Err(Error::service_validation(format!("配置解析失败: {e}")))
            }
        }
    }

    /// 运行应用程序的主入口
    async fn run_application(config_path: &Path) -> Result<()> {
        bootstrap_info!("📄 加载配置文件: {:?}", config_path);

        let config = match KeygateConfig::from_file(config_path) {
            Ok(config) => {
                bootstrap_info!("✅ 配置加载成功");

                if let Err(errors) = config.validate() {
                    bootstrap_error!("❌ 配置验证发现问题:");
                    let mut has_critical_errors = false;
                    for (i, err) in errors.iter().enumerate() {
                        if err.starts_with("Warning:") {
                            bootstrap_info!("  {}. ⚠️  {}", i + 1, err);
                        } else {
                            bootstrap_error!("  {}. ❌ {}", i + 1, err);
                            has_critical_errors = true;
                        }
                    }
                    if has_critical_errors {
                        return Err(Error::custom("配置验证失败，请修复上述错误".to_string()));
                    }
                }

                config
            }
            Err(e) => {
                bootstrap_error!("❌ 配置加载失败: {}", e);
                return Err(Error::custom(format!("配置加载失败: {e}")));
            }
        };

        // ensure sqlite_path directory exists
        if !config.sqlite_path.exists() {
            std::fs::create_dir_all(&config.sqlite_path).map_err(|e| {
                Error::custom(format!(
                    "Failed to create SQLite data directory {}: {e}",
                    config.sqlite_path.display()
                ))
            })?;
        }

        // 初始化可观测性系统（日志）
        let _observability_guard = init_observability(&config)?;

        // 写入 PID 文件（在绑定端口之前，需要权限）
        let pid_path = process::ProcessManager::write_pid_file(config.get_pid_path().as_deref())?;
        let _pid_guard = process::PidFileGuard::new(pid_path);

        // 需要在绑定端口之前记下目标用户，绑定后再切换
        let user = config.user.clone();
        let group = config.group.clone();

        Self::run_service_with_privilege_drop(config, user, group).await
    }

    /// 运行服务并在绑定端口后切换用户权限
    async fn run_service_with_privilege_drop(
        config: KeygateConfig,
        user: Option<String>,
        group: Option<String>,
    ) -> Result<()> {
        info!("🚀 启动 Keygate 令牌服务器");

        // 初始化 Prometheus metrics registry
        let registry = &keygate_common::metrics::REGISTRY;
        if let Err(e) = keygate_common::metrics::register_metrics() {
            warn!(
                "Prometheus metrics registration warning (may already be registered): {}",
                e
            );
        }
        if let Err(e) = tks::register_tks_metrics(registry) {
            warn!(
                "TKS metrics registration warning (may already be registered): {}",
                e
            );
        }
        info!("✅ Prometheus metrics registry 初始化成功");

        // 构建 TKS 服务（validate 已保证 services.tks 存在）
        let tks_config = config
            .services
            .tks
            .clone()
            .ok_or_else(|| Error::service_startup("services.tks configuration is missing"))?;

        let service = TksService::new(tks_config, &config.sqlite_path)
            .await
            .map_err(|e| Error::service_startup(format!("TKS 初始化失败: {e}")))?;

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .merge(service.create_router());

        let addr: SocketAddr = format!("{}:{}", config.bind.http.ip, config.bind.http.port)
            .parse()
            .map_err(|e| {
                Error::service_startup(format!(
                    "Invalid bind address {}:{}: {e}",
                    config.bind.http.ip, config.bind.http.port
                ))
            })?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::service_startup(format!("Failed to bind to {addr}: {e}")))?;
        let actual_addr = listener
            .local_addr()
            .map_err(|e| Error::service_startup(format!("Failed to get local address: {e}")))?;

        // 端口绑定完成后，切换用户和组
        if let Err(e) = process::ProcessManager::drop_privileges(user.as_deref(), group.as_deref())
        {
            error!("Failed to drop privileges: {}", e);
            // 继续运行，但记录错误
        }

        Self::display_service_info(&config, actual_addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::service_startup(format!("Server error: {e}")))?;

        info!("🛑 服务已安全关闭");
        Ok(())
    }

    /// 显示服务信息
    fn display_service_info(config: &KeygateConfig, addr: SocketAddr) {
        info!("✅ 服务已启动");
        info!("📡 HTTP 服务器监听在: http://{}", addr);
        info!("🔧 可用的API端点:");
        info!("  - GET  /genkey   颁发一次性密钥");
        info!("  - GET  /verify   核销密钥 (key= 或 token=)");
        info!("  - GET  /health   健康检查");
        info!("  - GET  /metrics  Prometheus 指标");

        let grant_gate = config
            .services
            .tks
            .as_ref()
            .is_some_and(|tks| tks.require_grant);
        if grant_gate {
            info!("  - POST /grant    铸造访问许可 (Bearer 管理密钥)");
        }
    }
}

async fn metrics_handler() -> String {
    keygate_common::metrics::export_metrics()
}

/// 等待 Ctrl-C 信号以触发优雅关闭
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("无法监听Ctrl-C信号: {}", e);
        return;
    }
    info!("收到Ctrl-C信号，开始优雅关闭...");
}
