//! 统一配置管理系统
//!
//! 本模块是 Keygate 服务配置的"单一真理之源"。
//! 所有配置项的定义、文档、默认值都在这里统一管理。

pub mod bind;

pub use crate::config::bind::{BindConfig, HttpBindConfig};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use tks::TksServiceConfig;

/// Keygate 服务的主配置结构体
///
/// 配置文件使用 TOML 格式，支持完整的类型安全加载。
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KeygateConfig {
    /// 服务器实例名称
    ///
    /// 用于标识不同的服务器实例，在多实例部署中用于区分节点。
    /// 建议使用有意义的命名规则，如：keygate-01, keygate-prod-east-1 等。
    pub name: String,

    /// 运行环境标识
    ///
    /// 指定当前运行环境，影响安全策略和默认行为：
    /// - "dev": 开发环境，宽松的密钥来源检查
    /// - "prod": 生产环境，严格的安全检查
    /// - "test": 测试环境，用于自动化测试
    pub env: String,

    /// 运行用户（可选）
    ///
    /// 指定服务运行的系统用户。服务会在绑定端口后切换到此用户运行，
    /// 以提高安全性。留空则保持当前用户。
    pub user: Option<String>,

    /// 运行用户组（可选）
    pub group: Option<String>,

    /// PID 文件路径（可选）
    ///
    /// 用于存储进程 ID 的文件路径。系统管理工具可以使用此文件
    /// 来监控和管理服务进程。
    pub pid: Option<String>,

    /// 网络绑定配置
    #[serde(default)]
    pub bind: BindConfig,

    /// 服务配置集合
    #[serde(default)]
    pub services: ServicesConfig,

    /// SQLite 数据库文件存储目录路径
    ///
    /// 令牌数据库文件将存储为 `{sqlite_path}/tks_tokens.db`。
    #[serde(
        serialize_with = "serialize_pathbuf",
        deserialize_with = "deserialize_pathbuf"
    )]
    pub sqlite_path: PathBuf,

    /// 可观测性配置（日志）
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// 服务配置集合
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ServicesConfig {
    /// TKS 令牌服务配置
    pub tks: Option<TksServiceConfig>,
}

/// 可观测性配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ObservabilityConfig {
    /// 过滤级别
    ///
    /// 支持 EnvFilter 语法（如 "info,hyper=warn"）。默认值 "info"。
    #[serde(default = "default_filter_level")]
    pub filter_level: String,

    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfig {
    /// 日志输出目标
    ///
    /// - "console": 仅输出到控制台（默认）
    /// - "file": 输出到文件
    #[serde(default = "default_log_output")]
    pub output: String,

    /// 日志轮转开关
    ///
    /// 当 output = "file" 时有效：
    /// - true: 按天轮转日志文件
    /// - false: 追加到单个文件
    #[serde(default)]
    pub rotate: bool,

    /// 日志文件路径
    ///
    /// 当 output = "file" 时有效
    #[serde(default = "default_log_path")]
    pub path: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            filter_level: default_filter_level(),
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: default_log_output(),
            rotate: false,
            path: default_log_path(),
        }
    }
}

fn default_log_output() -> String {
    "console".to_string()
}

fn default_log_path() -> String {
    "logs/".to_string()
}

fn default_filter_level() -> String {
    "info".to_string()
}

fn serialize_pathbuf<S>(path: &Path, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    path.display().to_string().serialize(serializer)
}

fn deserialize_pathbuf<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(PathBuf::from(s))
}

impl Default for KeygateConfig {
    fn default() -> Self {
        Self {
            name: "keygate-default".to_string(),
            env: "dev".to_string(),
            user: None,
            group: None,
            pid: Some("logs/keygate.pid".to_string()),
            bind: BindConfig::default(),
            services: ServicesConfig {
                tks: Some(TksServiceConfig::default()),
            },
            sqlite_path: PathBuf::from("database"),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl KeygateConfig {
    /// 获取 PID 文件路径，如果没有配置则使用默认值
    pub fn get_pid_path(&self) -> Option<String> {
        self.pid
            .clone()
            .or_else(|| Some("logs/keygate.pid".to_string()))
    }

    /// 返回可观测性配置引用
    pub fn observability_config(&self) -> &ObservabilityConfig {
        &self.observability
    }

    /// 返回日志配置引用
    pub fn log_config(&self) -> &LogConfig {
        &self.observability.log
    }

    /// 检查是否使用控制台日志输出
    pub fn is_console_logging(&self) -> bool {
        self.observability.log.output == "console"
    }

    /// 检查是否应该轮转日志
    pub fn should_rotate_logs(&self) -> bool {
        self.observability.log.output == "file" && self.observability.log.rotate
    }

    /// 获取日志过滤级别，优先使用 RUST_LOG
    pub fn get_filter_level(&self) -> String {
        std::env::var("RUST_LOG")
            .ok()
            .and_then(|v| {
                let trimmed = v.trim().to_string();
                if trimmed.is_empty() { None } else { Some(trimmed) }
            })
            .unwrap_or_else(|| self.observability.filter_level.clone())
    }

    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(format!("Configuration file does not exist: {path_ref:?}").into());
        }

        if !path_ref.is_file() {
            return Err(format!("Path is not a valid file: {path_ref:?}").into());
        }

        let content = std::fs::read_to_string(path_ref)?;
        let config: KeygateConfig = toml::from_str(&content)?;

        Ok(config)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// 将配置序列化为 TOML 字符串
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// 验证配置有效性
    ///
    /// 检查所有配置项的合法性。以 "Warning:" 开头的条目提示
    /// 可运行但不推荐的配置。
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // 验证实例名称
        if self.name.trim().is_empty() {
            errors.push("Instance name cannot be empty".to_string());
        }

        // 验证环境
        if !["dev", "prod", "test"].contains(&self.env.as_str()) {
            errors.push(format!(
                "Invalid environment '{}', must be one of: dev, prod, test",
                self.env
            ));
        }

        // 验证过滤级别（EnvFilter 语法）
        {
            let main_level = self
                .observability
                .filter_level
                .split(',')
                .next()
                .unwrap_or("")
                .trim();
            if !["trace", "debug", "info", "warn", "error"].contains(&main_level) {
                errors.push(format!(
                    "Invalid filter level '{}', must start with one of: trace, debug, info, warn, error",
                    self.observability.filter_level
                ));
            }
        }

        // 验证日志输出
        if !["console", "file"].contains(&self.observability.log.output.as_str()) {
            errors.push(format!(
                "Invalid log output '{}' (observability.log.output), must be 'console' or 'file'",
                self.observability.log.output
            ));
        }

        // 验证 SQLite 路径
        if self
            .sqlite_path
            .to_str()
            .map(|s| s.trim().is_empty())
            .unwrap_or(true)
        {
            errors.push("SQLite database path cannot be empty".to_string());
        }

        // 验证 TKS 配置
        match self.services.tks {
            Some(ref tks) => {
                if tks.envelope_key_source().is_none() {
                    errors.push(
                        "TKS envelope key is not configured: set services.tks.envelope_key_file, \
                         envelope_key_env or envelope_key"
                            .to_string(),
                    );
                }

                if tks.token_ttl_seconds <= 0 {
                    errors.push("TKS token_ttl_seconds must be positive".to_string());
                }

                if tks.grant_ttl_seconds <= 0 {
                    errors.push("TKS grant_ttl_seconds must be positive".to_string());
                }

                if tks.quota.enabled && tks.quota.limit == 0 {
                    errors.push(
                        "TKS quota is enabled with limit 0, every issue request would be rejected"
                            .to_string(),
                    );
                }

                if tks.require_grant && tks.admin_key_source().is_none() {
                    errors.push(
                        "TKS require_grant is enabled but no admin key is configured: \
                         grants can only be minted with admin credentials"
                            .to_string(),
                    );
                }

                // 生产环境额外检查
                if self.env == "prod" {
                    if tks.envelope_key.is_some() {
                        errors.push(
                            "Warning: Production environment should not embed the envelope key \
                             in the config file, use envelope_key_file or envelope_key_env"
                                .to_string(),
                        );
                    }
                    if tks.admin_key.is_some() {
                        errors.push(
                            "Warning: Production environment should not embed the admin key \
                             in the config file, use admin_key_file or admin_key_env"
                                .to_string(),
                        );
                    }
                }
            }
            None => {
                errors.push("services.tks configuration is missing".to_string());
            }
        }

        // 生产环境日志检查
        if self.env == "prod" {
            if self.observability.log.output == "console" {
                errors.push("Warning: Production environment should use file logging (observability.log.output = \"file\")".to_string());
            }

            if self.observability.log.output == "file" && !self.observability.log.rotate {
                errors.push("Warning: Production environment should enable log rotation (observability.log.rotate = true)".to_string());
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
