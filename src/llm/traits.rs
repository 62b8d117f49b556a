//! 模型传输层抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 ModelTransport：send（非流式）、send_stream（流式推送）。
//! 流式结果由传输层经 StreamSink 推送，以显式的 Done 结束；错误通过返回 Err 表达。

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::memory::Message;
use crate::tools::ToolSpec;

/// 传输层错误面；只有 RateLimited 与 TransientNetwork 可重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown API error: {0}")]
    Unknown(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::TransientNetwork(_)
        )
    }

    /// 服务端建议的等待时间（仅 RateLimited 携带）
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            LlmError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

/// 单次调用的 token 统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// 发往传输层的请求
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolSpec>,
    pub stream: bool,
}

/// 非流式响应：一条 assistant 消息
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub usage: Option<Usage>,
}

/// tool_call 的流式片段；同一 index 的片段拼接为完整调用
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// 传输层推送的流事件
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta {
        content: Option<String>,
        tool_calls: Vec<ToolCallDelta>,
    },
    Usage(Usage),
    /// 显式完成标记
    Done,
}

pub(crate) type StreamItem = Result<StreamEvent, LlmError>;

/// 生产端句柄：send 返回 false 表示消费端已放弃，生产者应尽快停止
#[derive(Debug, Clone)]
pub struct StreamSink {
    tx: mpsc::UnboundedSender<StreamItem>,
}

impl StreamSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<StreamItem>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: StreamEvent) -> bool {
        self.tx.send(Ok(event)).is_ok()
    }

    pub fn content(&self, text: impl Into<String>) -> bool {
        self.send(StreamEvent::Delta {
            content: Some(text.into()),
            tool_calls: Vec::new(),
        })
    }

    pub fn tool_call(&self, delta: ToolCallDelta) -> bool {
        self.send(StreamEvent::Delta {
            content: None,
            tool_calls: vec![delta],
        })
    }

    pub fn usage(&self, usage: Usage) -> bool {
        self.send(StreamEvent::Usage(usage))
    }

    pub fn done(&self) -> bool {
        self.send(StreamEvent::Done)
    }

    pub(crate) fn fail(&self, err: LlmError) -> bool {
        self.tx.send(Err(err)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// 将一次完整响应按流事件重放（content -> tool_calls -> usage -> Done）
    pub fn replay(&self, response: ChatResponse) -> bool {
        let ChatResponse { message, usage } = response;
        if let Some(text) = message.content.filter(|t| !t.is_empty()) {
            if !self.content(text) {
                return false;
            }
        }
        for (index, call) in message.tool_calls.into_iter().enumerate() {
            let delta = ToolCallDelta {
                index,
                id: Some(call.id),
                name: Some(call.name),
                arguments: Some(call.arguments),
            };
            if !self.tool_call(delta) {
                return false;
            }
        }
        if let Some(u) = usage {
            if !self.usage(u) {
                return false;
            }
        }
        self.done()
    }
}

/// 模型传输 trait：消费方只依赖这一契约
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// 非流式请求
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// 流式请求：边读边经 sink 推送，结束时推送 Done；默认实现为 send + replay
    async fn send_stream(&self, request: ChatRequest, sink: StreamSink) -> Result<(), LlmError> {
        let response = self.send(&request).await?;
        sink.replay(response);
        Ok(())
    }

    /// 后端名（日志用）
    fn name(&self) -> &str {
        "transport"
    }
}
