//! DeepSeek 传输（OpenAI 兼容格式）
//!
//! DeepSeek 提供与 OpenAI 完全兼容的 API 接口。
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat（未配置 llm.model 时的默认值），也可配置 deepseek-reasoner

use std::time::Duration;

use crate::core::AgentError;
use crate::llm::OpenAiTransport;

/// DeepSeek API 常量
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 创建 DeepSeek 传输；base_url 为空时使用官方地址
pub fn deepseek_transport(
    base_url: Option<&str>,
    api_key: &str,
    request_timeout: Duration,
) -> Result<OpenAiTransport, AgentError> {
    let base = base_url.unwrap_or(DEEPSEEK_BASE_URL);
    Ok(OpenAiTransport::new(Some(base), api_key, request_timeout)?.with_name("deepseek"))
}
