//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PILOT__*` 覆盖（双下划线表示嵌套，如 `PILOT__LLM__PROVIDER=openai`）。
//! API Key 只在程序边界读取一次，随后显式传入传输层构造函数。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{AgentError, OrchestratorConfig};
use crate::llm::{RetryConfig, DEEPSEEK_CHAT};
use crate::memory::ConversationConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// 模型后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Mock,
    Openai,
    Deepseek,
}

impl Provider {
    /// 未配置 llm.model 时使用的模型
    pub fn default_model(self) -> &'static str {
        match self {
            Provider::Mock => "mock",
            Provider::Openai => "gpt-4o-mini",
            Provider::Deepseek => DEEPSEEK_CHAT,
        }
    }
}

/// [llm] 段：后端选择、模型参数与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: Provider,
    /// 未设置时按 provider 取默认模型
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 直接配置的 Key（优先于 api_key_env）
    pub api_key: Option<String>,
    /// 读取 Key 的环境变量名；未设置时按 provider 取 OPENAI_API_KEY / DEEPSEEK_API_KEY
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub request_timeout_secs: u64,
    pub retry: RetrySection,
    pub stream: StreamSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: Provider::Mock,
            model: None,
            base_url: None,
            api_key: None,
            api_key_env: None,
            temperature: 0.7,
            max_tokens: None,
            request_timeout_secs: 60,
            retry: RetrySection::default(),
            stream: StreamSection::default(),
        }
    }
}

impl LlmSection {
    pub fn model_name(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.provider.default_model())
    }

    /// 解析 API Key：配置值 > 指定环境变量 > provider 默认环境变量
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        let var = self.api_key_env.clone().unwrap_or_else(|| {
            match self.provider {
                Provider::Deepseek => "DEEPSEEK_API_KEY",
                _ => "OPENAI_API_KEY",
            }
            .to_string()
        });
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// [llm.retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }
}

/// [llm.stream] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub idle_timeout_secs: u64,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
        }
    }
}

/// [agent] 段：system prompt、上下文窗口、工具循环上限、整轮超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub system_prompt: String,
    pub max_history: usize,
    pub max_tool_iterations: usize,
    pub turn_timeout_secs: u64,
    pub streaming: bool,
    pub max_turn_history: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            system_prompt: "You are Pilot, a helpful assistant. Use the available tools when they help; \
                            answer directly when they do not."
                .to_string(),
            max_history: 20,
            max_tool_iterations: 10,
            turn_timeout_secs: 300,
            streaming: true,
            max_turn_history: 100,
        }
    }
}

/// [tools] 段：单次工具超时、并发上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub max_concurrent: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            max_concurrent: 4,
        }
    }
}

impl AppConfig {
    /// 拒绝会让编排失去意义的零值
    pub fn validate(&self) -> Result<(), AgentError> {
        let checks = [
            (self.llm.retry.max_retries == 0, "llm.retry.max_retries must be >= 1"),
            (self.agent.max_tool_iterations == 0, "agent.max_tool_iterations must be >= 1"),
            (self.agent.max_history == 0, "agent.max_history must be >= 1"),
            (self.tools.max_concurrent == 0, "tools.max_concurrent must be >= 1"),
            (self.agent.turn_timeout_secs == 0, "agent.turn_timeout_secs must be >= 1"),
            (self.llm.stream.idle_timeout_secs == 0, "llm.stream.idle_timeout_secs must be >= 1"),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, msg)) => Err(AgentError::ConfigError(msg.to_string())),
            None => Ok(()),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.llm.retry.max_retries,
            initial_delay: Duration::from_millis(self.llm.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.llm.retry.max_delay_ms),
        }
    }

    pub fn conversation_config(&self) -> ConversationConfig {
        ConversationConfig {
            model: self.llm.model_name().to_string(),
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
            max_history: self.agent.max_history,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_tool_iterations: self.agent.max_tool_iterations,
            turn_timeout: Duration::from_secs(self.agent.turn_timeout_secs),
            streaming: self.agent.streaming,
            max_turn_history: self.agent.max_turn_history,
        }
    }
}

/// 从 config 目录加载配置，环境变量 PILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PILOT__*（双下划线表示嵌套键）
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
        } else {
            tracing::warn!(path = %path.display(), "config file not found, skipped");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PILOT")
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
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.llm.provider, Provider::Mock);
        assert_eq!(cfg.retry_config(), RetryConfig::default());
        assert_eq!(cfg.conversation_config().max_history, 20);
        assert_eq!(cfg.orchestrator_config().max_tool_iterations, 10);
    }

    #[test]
    fn test_model_defaults_follow_provider() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = Provider::Deepseek;
        assert_eq!(cfg.conversation_config().model, DEEPSEEK_CHAT);
        cfg.llm.model = Some("deepseek-reasoner".into());
        assert_eq!(cfg.conversation_config().model, "deepseek-reasoner");
        cfg.llm.provider = Provider::Openai;
        cfg.llm.model = None;
        assert_eq!(cfg.llm.model_name(), "gpt-4o-mini");
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let mut cfg = AppConfig::default();
        cfg.agent.max_tool_iterations = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_tool_iterations"));

        let mut cfg = AppConfig::default();
        cfg.llm.retry.max_retries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pilot.toml");
        std::fs::write(
            &path,
            r#"
[llm]
provider = "deepseek"
api_key = "sk-file"

[llm.retry]
max_retries = 5

[agent]
max_tool_iterations = 4
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.llm.provider, Provider::Deepseek);
        assert_eq!(cfg.llm.model_name(), "deepseek-chat");
        assert_eq!(cfg.llm.retry.max_retries, 5);
        // 未覆盖的键保持默认
        assert_eq!(cfg.llm.retry.initial_delay_ms, 500);
        assert_eq!(cfg.agent.max_tool_iterations, 4);
        assert_eq!(cfg.llm.resolve_api_key().as_deref(), Some("sk-file"));
    }
}
