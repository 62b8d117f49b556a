//! Mock 传输层（用于测试与离线运行，无需 API）
//!
//! - MockTransport：用户消息先回显为 echo 工具调用，拿到工具结果后给出最终答复，便于本地跑通工具循环。
//! - ScriptedTransport：按脚本依次返回预置回复或错误，并记录收到的请求。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{ChatRequest, ChatResponse, LlmError, ModelTransport, StreamSink, ToolCallDelta, Usage};
use crate::memory::{Message, Role, ToolCall};

/// 估算 usage：按空白切分计数
fn estimate_usage(request: &ChatRequest, reply: &Message) -> Usage {
    let prompt: usize = request
        .messages
        .iter()
        .map(|m| m.text().split_whitespace().count())
        .sum();
    let completion = reply.text().split_whitespace().count()
        + reply
            .tool_calls
            .iter()
            .map(|c| c.arguments.len() / 4 + 1)
            .sum::<usize>();
    Usage {
        prompt_tokens: prompt as u64,
        completion_tokens: completion as u64,
        total_tokens: (prompt + completion) as u64,
    }
}

/// 把一条完整回复按流式片段推送：文本按词切分，tool_call 参数拆成两段
async fn push_chunks(sink: &StreamSink, reply: Message, usage: Usage, pause: Duration) {
    if let Some(text) = reply.content.as_deref() {
        for word in text.split_inclusive(' ') {
            if !sink.content(word) {
                return;
            }
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
    }
    for (index, call) in reply.tool_calls.into_iter().enumerate() {
        let split = call
            .arguments
            .char_indices()
            .nth(call.arguments.chars().count() / 2)
            .map_or(call.arguments.len(), |(i, _)| i);
        let (head, tail) = call.arguments.split_at(split);
        let first = ToolCallDelta {
            index,
            id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            arguments: Some(head.to_string()),
        };
        let second = ToolCallDelta {
            index,
            arguments: Some(tail.to_string()),
            ..Default::default()
        };
        if !sink.tool_call(first) || !sink.tool_call(second) {
            return;
        }
    }
    if sink.usage(usage) {
        sink.done();
    }
}

/// Mock 传输：先回显为工具调用，再以工具结果作答
#[derive(Debug, Default)]
pub struct MockTransport;

impl MockTransport {
    fn reply(request: &ChatRequest) -> Message {
        match request.messages.last() {
            Some(last) if last.role == Role::Tool => {
                Message::assistant(format!("Done. Tool said: {}", last.text()))
            }
            _ => {
                let last_user = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.text())
                    .unwrap_or("(no input)");
                let can_echo = request.tools.iter().any(|t| t.name == "echo");
                if !can_echo {
                    return Message::assistant(format!("Echo from Mock: {last_user}"));
                }
                let arguments = serde_json::json!({ "text": format!("Echo from Mock: {last_user}") });
                Message::assistant_with_tool_calls(
                    None,
                    vec![ToolCall::new(
                        format!("call_{}", uuid::Uuid::new_v4().simple()),
                        "echo",
                        arguments.to_string(),
                    )],
                )
            }
        }
    }
}

#[async_trait]
impl ModelTransport for MockTransport {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let message = Self::reply(request);
        let usage = estimate_usage(request, &message);
        Ok(ChatResponse {
            message,
            usage: Some(usage),
        })
    }

    async fn send_stream(&self, request: ChatRequest, sink: StreamSink) -> Result<(), LlmError> {
        let message = Self::reply(&request);
        let usage = estimate_usage(&request, &message);
        push_chunks(&sink, message, usage, Duration::from_millis(15)).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 脚本传输：每次调用弹出一项；脚本耗尽时返回 Unknown 错误
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Message, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, message: Message) -> Self {
        lock(&self.script).push_back(Ok(message));
        self
    }

    pub fn fail(self, err: LlmError) -> Self {
        lock(&self.script).push_back(Err(err));
        self
    }

    /// 每次调用前等待 latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 至今收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }

    async fn next(&self, request: &ChatRequest) -> Result<Message, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Unknown("script exhausted".to_string())))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let message = self.next(request).await?;
        let usage = estimate_usage(request, &message);
        Ok(ChatResponse {
            message,
            usage: Some(usage),
        })
    }

    async fn send_stream(&self, request: ChatRequest, sink: StreamSink) -> Result<(), LlmError> {
        let message = self.next(&request).await?;
        let usage = estimate_usage(&request, &message);
        push_chunks(&sink, message, usage, Duration::ZERO).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, ToolRegistry};

    fn request(messages: Vec<Message>) -> ChatRequest {
        let mut registry: ToolRegistry<()> = ToolRegistry::new();
        registry.register(EchoTool);
        ChatRequest {
            model: "mock".into(),
            messages,
            temperature: 0.0,
            max_tokens: None,
            tools: registry.specs(),
            stream: false,
        }
    }

    #[tokio::test]
    async fn test_mock_echoes_then_answers() {
        let mock = MockTransport;
        let first = mock.send(&request(vec![Message::user("hi")])).await.unwrap();
        assert_eq!(first.message.tool_calls.len(), 1);
        let call = first.message.tool_calls[0].clone();
        assert_eq!(call.name, "echo");
        assert!(call.arguments.contains("Echo from Mock: hi"));

        let second = mock
            .send(&request(vec![
                Message::user("hi"),
                first.message,
                Message::tool(call.id, "Echo from Mock: hi"),
            ]))
            .await
            .unwrap();
        assert!(!second.message.has_tool_calls());
        assert!(second.message.text().contains("Echo from Mock: hi"));
    }

    #[tokio::test]
    async fn test_scripted_pops_in_order_and_records() {
        let t = ScriptedTransport::new()
            .reply(Message::assistant("one"))
            .fail(LlmError::Auth("nope".into()));
        let req = request(vec![Message::user("q")]);
        assert_eq!(t.send(&req).await.unwrap().message.text(), "one");
        assert_eq!(t.send(&req).await.unwrap_err(), LlmError::Auth("nope".into()));
        assert!(matches!(t.send(&req).await, Err(LlmError::Unknown(_))));
        assert_eq!(t.calls(), 3);
        assert_eq!(t.requests().len(), 3);
        assert_eq!(t.remaining(), 0);
    }
}
