//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TEAMWORK__*` 覆盖（双下划线表示嵌套，如 `TEAMWORK__SANDBOX__MAX_HOPS=3`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// [app] 段：应用名、对话历史条数上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 每个会话保留的最近消息条数（超出后每轮结束时剪枝）
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            history_limit: default_history_limit(),
        }
    }
}

fn default_history_limit() -> usize {
    50
}

/// [llm] 段：OpenAI 兼容后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时回退到 OPENAI_API_KEY 环境变量
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
    /// 单次回复的 token 上限；不设置时由服务端决定
    pub max_tokens: Option<u32>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

fn default_temperature() -> Option<f32> {
    Some(0.7)
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

/// [sandbox] 段：脚本执行超时、内存、抓取上限与续写轮数
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    /// 模型未指定 timeout_seconds 时的默认超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_min_timeout_secs")]
    pub min_timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    /// 解释器堆内存上限（字节）
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: usize,
    #[serde(default = "default_stack_limit")]
    pub max_stack_bytes: usize,
    /// fetch 响应体上限（字节）
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: usize,
    /// 单轮用户消息内最多再生成几轮代码（continuation hop）
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    /// 校验 / 语法错误反馈给模型自我修正的最大次数
    #[serde(default = "default_max_repairs")]
    pub max_repairs: usize,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            min_timeout_secs: default_min_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            memory_limit_bytes: default_memory_limit(),
            max_stack_bytes: default_stack_limit(),
            fetch_max_bytes: default_fetch_max_bytes(),
            max_hops: default_max_hops(),
            max_repairs: default_max_repairs(),
        }
    }
}

impl SandboxSection {
    /// 将请求的超时限制在 [min, max] 区间内（越界时截断而不是拒绝）
    pub fn clamp_timeout(&self, requested: Option<u64>) -> Duration {
        let secs = requested
            .unwrap_or(self.default_timeout_secs)
            .clamp(self.min_timeout_secs, self.max_timeout_secs.max(self.min_timeout_secs));
        Duration::from_secs(secs)
    }
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_min_timeout_secs() -> u64 {
    1
}

fn default_max_timeout_secs() -> u64 {
    60
}

fn default_memory_limit() -> usize {
    64 * 1024 * 1024
}

fn default_stack_limit() -> usize {
    1024 * 1024
}

fn default_fetch_max_bytes() -> usize {
    1024 * 1024
}

fn default_max_hops() -> usize {
    2
}

fn default_max_repairs() -> usize {
    1
}

/// [registry] 段：待确认操作的过期时间
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

/// [storage] 段：SQLite 数据库路径
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/teamwork.db")
}

/// 从 config 目录加载配置，环境变量 TEAMWORK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TEAMWORK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TEAMWORK")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.history_limit, 50);
        assert_eq!(cfg.sandbox.default_timeout_secs, 10);
        assert_eq!(cfg.sandbox.fetch_max_bytes, 1024 * 1024);
        assert_eq!(cfg.sandbox.max_hops, 2);
        assert_eq!(cfg.llm.temperature, Some(0.7));
        assert_eq!(cfg.llm.max_tokens, None);
    }

    #[test]
    fn test_clamp_timeout() {
        let s = SandboxSection::default();
        assert_eq!(s.clamp_timeout(None), Duration::from_secs(10));
        assert_eq!(s.clamp_timeout(Some(0)), Duration::from_secs(1));
        assert_eq!(s.clamp_timeout(Some(600)), Duration::from_secs(60));
        assert_eq!(s.clamp_timeout(Some(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[sandbox]\nmax_hops = 3\n\n[app]\nhistory_limit = 20\n\n[llm]\nmodel = \"deepseek-chat\"\nmax_tokens = 2048\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.sandbox.max_hops, 3);
        assert_eq!(cfg.app.history_limit, 20);
        assert_eq!(cfg.sandbox.max_timeout_secs, 60);
        assert_eq!(cfg.llm.model, "deepseek-chat");
        assert_eq!(cfg.llm.max_tokens, Some(2048));
        assert_eq!(cfg.llm.temperature, Some(0.7));
    }
}
