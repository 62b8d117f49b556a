//! LLM 层：传输抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、重试、流适配、模型客户端

pub mod client;
pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod retry;
pub mod stream;
pub mod traits;

pub use client::{ChunkCallback, ModelClient, TokenUsage, DEFAULT_IDLE_TIMEOUT};
pub use deepseek::{deepseek_transport, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use mock::{MockTransport, ScriptedTransport};
pub use openai::{OpenAiTransport, OPENAI_BASE_URL};
pub use retry::{RetryConfig, RetryDecision};
pub use stream::{StreamAdapter, StreamError, ToolCallAccumulator};
pub use traits::{
    ChatRequest, ChatResponse, LlmError, ModelTransport, StreamEvent, StreamSink, ToolCallDelta, Usage,
};
