//! 模型客户端
//!
//! 在传输层之上统一处理：按会话构造请求（裁剪历史）、重试退避、流式拼接、token 统计。
//! 流式模式下只有「尚未向消费端交付任何内容」的打开失败会重试，已开始输出后的错误直接终止本次调用。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{
    ChatRequest, ChatResponse, ModelTransport, RetryConfig, StreamAdapter, StreamError, Usage,
};
use crate::memory::{Conversation, Message, ToolCall};
use crate::tools::ToolSpec;

/// 流式文本块回调
pub type ChunkCallback<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// 默认流空闲超时
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// 累计 token 使用统计（可跨任务共享）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, usage: Usage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// 模型客户端：持有传输层、重试策略与流空闲超时
pub struct ModelClient {
    transport: Arc<dyn ModelTransport>,
    retry: RetryConfig,
    idle_timeout: Duration,
    usage: TokenUsage,
}

impl ModelClient {
    pub fn new(transport: Arc<dyn ModelTransport>) -> Self {
        Self {
            transport,
            retry: RetryConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            usage: TokenUsage::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// 获取累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    /// 以会话配置构造请求；消息为裁剪后的副本，会话本身不变
    pub fn build_request(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
        stream: bool,
    ) -> ChatRequest {
        let config = conversation.config();
        ChatRequest {
            model: config.model.clone(),
            messages: conversation.outgoing_messages(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            tools: tools.to_vec(),
            stream,
        }
    }

    /// 一次模型调用，得到一条 assistant 消息（可能含 tool_calls）。
    ///
    /// 流式时每个文本块按到达顺序交给 on_chunk；不修改会话。
    pub async fn chat(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
        streaming: bool,
        on_chunk: Option<&ChunkCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Message, AgentError> {
        let request = self.build_request(conversation, tools, streaming);
        tracing::debug!(
            transport = %self.transport.name(),
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            streaming,
            "model call"
        );
        if streaming {
            self.chat_stream(request, on_chunk, cancel).await
        } else {
            self.chat_once(request, cancel).await
        }
    }

    async fn chat_once(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<Message, AgentError> {
        let call = self
            .retry
            .run(cancel, |_attempt| self.transport.send(&request));
        let ChatResponse { message, usage } = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            response = call => response?,
        };
        self.record_usage(usage);
        Ok(message)
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        on_chunk: Option<&ChunkCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Message, AgentError> {
        let (mut adapter, attempts) = self.open_counted(request, cancel).await?;
        let mut content = String::new();
        while let Some(chunk) = adapter.next_chunk().await {
            let chunk = chunk.map_err(|e| stream_failure(e, attempts))?;
            if let Some(callback) = on_chunk {
                callback(&chunk);
            }
            content.push_str(&chunk);
        }
        let tool_calls = adapter.take_tool_calls();
        self.record_usage(adapter.usage());
        Ok(assemble(content, tool_calls))
    }

    /// 打开一条流并等到第一个事件；打开阶段的可重试错误按策略重试
    async fn open_counted(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<(StreamAdapter, u32), AgentError> {
        let mut attempts = 0u32;
        let opened = self
            .retry
            .run(cancel, |attempt| {
                attempts = attempt + 1;
                let mut adapter = StreamAdapter::spawn(
                    Arc::clone(&self.transport),
                    request.clone(),
                    self.idle_timeout,
                    cancel.clone(),
                );
                async move {
                    match adapter.prime().await {
                        Ok(()) => Ok(Ok(adapter)),
                        Err(StreamError::Transport(e)) => Err(e),
                        Err(other) => Ok(Err(other)),
                    }
                }
            })
            .await?;
        opened
            .map(|adapter| (adapter, attempts))
            .map_err(|e| stream_failure(e, attempts))
    }

    fn record_usage(&self, usage: Option<Usage>) {
        let Some(usage) = usage else { return };
        self.usage.add(usage);
        let (_, _, total) = self.usage.get();
        tracing::info!(
            event = "model_usage",
            transport = %self.transport.name(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            cumulative_total = total,
            "token usage"
        );
    }
}

/// 轮次令牌被取消即用户中止，与非流式路径一样报告为 Cancelled
fn stream_failure(err: StreamError, attempts: u32) -> AgentError {
    match err {
        StreamError::Cancelled => AgentError::Cancelled,
        other => other.into_agent_error(attempts),
    }
}

fn assemble(content: String, tool_calls: Vec<ToolCall>) -> Message {
    if tool_calls.is_empty() {
        Message::assistant(content)
    } else {
        let content = Some(content).filter(|c| !c.is_empty());
        Message::assistant_with_tool_calls(content, tool_calls)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::llm::{LlmError, ScriptedTransport};
    use crate::memory::{ConversationConfig, Role};

    fn conversation(max_history: usize) -> Conversation {
        let mut conv = Conversation::new(ConversationConfig {
            max_history,
            ..Default::default()
        })
        .with_system_prompt("sys");
        for i in 0..6 {
            conv.push(Message::user(format!("u{i}"))).unwrap();
            conv.push(Message::assistant(format!("a{i}"))).unwrap();
        }
        conv
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_request_is_trimmed_copy() {
        let transport = Arc::new(ScriptedTransport::new().reply(Message::assistant("ok")));
        let client = ModelClient::new(transport.clone());
        let conv = conversation(4);

        let reply = client
            .chat(&conv, &[], false, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.text(), "ok");
        assert_eq!(conv.len(), 13);

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].messages.len(), 5);
        assert_eq!(sent[0].messages[0].role, Role::System);
        assert_eq!(sent[0].messages[1].text(), "u4");
        assert_eq!(sent[0].messages[4].text(), "a5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .fail(LlmError::TransientNetwork("reset".into()))
                .fail(LlmError::RateLimited { retry_after_ms: None })
                .reply(Message::assistant("finally")),
        );
        let client = ModelClient::new(transport.clone()).with_retry(fast_retry());
        let reply = client
            .chat(&conversation(20), &[], false, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.text(), "finally");
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_is_not_retried() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .fail(LlmError::Auth("bad key".into()))
                .reply(Message::assistant("never")),
        );
        let client = ModelClient::new(transport.clone()).with_retry(fast_retry());
        let err = client
            .chat(&conversation(20), &[], true, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::FatalApi { attempts: 1, .. }), "{err:?}");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_open_retries_before_first_chunk() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .fail(LlmError::TransientNetwork("refused".into()))
                .reply(Message::assistant("hello streaming world")),
        );
        let client = ModelClient::new(transport.clone()).with_retry(fast_retry());
        let seen = Mutex::new(Vec::new());
        let on_chunk = |chunk: &str| seen.lock().unwrap().push(chunk.to_string());

        let reply = client
            .chat(&conversation(20), &[], true, Some(&on_chunk), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.text(), "hello streaming world");
        assert_eq!(seen.lock().unwrap().concat(), "hello streaming world");
        assert!(seen.lock().unwrap().len() > 1);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_stream_assembles_tool_calls_and_usage() {
        let transport = Arc::new(ScriptedTransport::new().reply(Message::assistant_with_tool_calls(
            None,
            vec![
                ToolCall::new("a", "echo", r#"{"text":"one"}"#),
                ToolCall::new("b", "echo", r#"{"text":"two"}"#),
            ],
        )));
        let client = ModelClient::new(transport);
        let reply = client
            .chat(&conversation(20), &[], true, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(reply.content.is_none());
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[1].arguments, r#"{"text":"two"}"#);
        assert!(client.token_usage().2 > 0);
    }

    #[tokio::test]
    async fn test_cancel_before_call() {
        let transport = Arc::new(ScriptedTransport::new().reply(Message::assistant("x")));
        let client = ModelClient::new(transport);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .chat(&conversation(20), &[], false, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_while_streaming_reports_cancelled() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .with_latency(Duration::from_millis(500))
                .reply(Message::assistant("late")),
        );
        let client = ModelClient::new(transport);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = client
            .chat(&conversation(20), &[], true, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled), "{err:?}");
        assert!(!err.is_api_failure());
    }
}
