//! Agent 错误类型
//!
//! 只有「中止本轮」的两类错误会越过编排器边界：API 失败（含流超时/取消）与工具循环超限。
//! 工具层失败在分发边界被吸收为 tool 消息，不会出现在这里。

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;

/// 一轮编排中可能返回给调用方的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 不可重试的 API 错误，或重试耗尽；source 为最后一次的原因
    #[error("Model API failed after {attempts} attempt(s): {source}")]
    FatalApi {
        attempts: u32,
        #[source]
        source: LlmError,
    },

    #[error("Stream idle timeout after {0:?}")]
    StreamTimeout(Duration),

    #[error("Stream cancelled")]
    StreamCancelled,

    #[error("Stream closed before completion marker")]
    StreamClosed,

    /// 模型持续请求工具，超过单轮模型调用上限
    #[error("Tool loop exceeded: {max_iterations} model calls without a final answer")]
    LoopExceeded { max_iterations: usize },

    #[error("Turn deadline exceeded after {0:?}")]
    TurnTimeout(Duration),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Conversation busy: another turn is in flight")]
    ConversationBusy,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 「模型行为异常」：用于与 API 故障区分
    pub fn is_loop_exceeded(&self) -> bool {
        matches!(self, AgentError::LoopExceeded { .. })
    }

    /// API 侧失败（含流超时、流取消、流提前关闭）
    pub fn is_api_failure(&self) -> bool {
        matches!(
            self,
            AgentError::FatalApi { .. }
                | AgentError::StreamTimeout(_)
                | AgentError::StreamCancelled
                | AgentError::StreamClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinct() {
        let api = AgentError::FatalApi {
            attempts: 3,
            source: LlmError::RateLimited { retry_after_ms: None },
        };
        let looped = AgentError::LoopExceeded { max_iterations: 5 };
        assert!(api.is_api_failure() && !api.is_loop_exceeded());
        assert!(looped.is_loop_exceeded() && !looped.is_api_failure());
        assert!(AgentError::StreamTimeout(Duration::from_secs(1)).is_api_failure());
    }

    #[test]
    fn test_fatal_api_keeps_cause() {
        let err = AgentError::FatalApi {
            attempts: 1,
            source: LlmError::Auth("bad key".to_string()),
        };
        assert!(err.to_string().contains("bad key"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
