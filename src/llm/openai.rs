//! OpenAI 兼容传输层（POST {base}/chat/completions，流式为 SSE）
//!
//! HTTP 状态映射到 LlmError：429 为限流（解析 Retry-After），401/403 鉴权，400/404/422 请求无效，
//! 408/5xx 与连接/超时错误为瞬时网络错误，其余为未知错误。

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::{
    ChatRequest, ChatResponse, LlmError, ModelTransport, StreamEvent, StreamSink, ToolCallDelta, Usage,
};
use crate::memory::{Message, Role, ToolCall};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// 错误体在日志与错误信息中保留的最大字符数
const ERROR_BODY_CHARS: usize = 500;

// ---- 请求体 ----

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireToolFunction<'a>,
}

#[derive(Serialize)]
struct WireToolFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

impl<'a> WireRequest<'a> {
    fn from_request(request: &'a ChatRequest, stream: bool) -> Self {
        let messages = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: m.role,
                content: m.content.as_deref(),
                tool_calls: m
                    .tool_calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: &c.id,
                        kind: "function",
                        function: WireFunction {
                            name: &c.name,
                            arguments: &c.arguments,
                        },
                    })
                    .collect(),
                tool_call_id: m.tool_call_id.as_deref(),
            })
            .collect();
        let tools = request
            .tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireToolFunction {
                    name: &t.name,
                    description: &t.description,
                    parameters: &t.parameters,
                },
            })
            .collect();
        Self {
            model: &request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools,
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        }
    }
}

// ---- 响应体 ----

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl CompletionResponse {
    fn into_chat_response(self) -> Result<ChatResponse, LlmError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Unknown("response has no choices".to_string()))?;
        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCall::new(c.id, c.function.name, c.function.arguments))
            .collect();
        let message = if tool_calls.is_empty() {
            Message::assistant(choice.message.content.unwrap_or_default())
        } else {
            Message::assistant_with_tool_calls(choice.message.content, tool_calls)
        };
        Ok(ChatResponse {
            message,
            usage: self.usage.map(Usage::from),
        })
    }
}

#[derive(Deserialize)]
struct ChunkData {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<ChunkFunction>,
}

#[derive(Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

impl ChunkData {
    /// 只看第一个 choice；空 delta（心跳/角色标记）跳过
    fn into_events(self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(choice) = self.choices.into_iter().next() {
            let content = choice.delta.content.filter(|c| !c.is_empty());
            let tool_calls: Vec<ToolCallDelta> = choice
                .delta
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|c| {
                    let (name, arguments) = c
                        .function
                        .map_or((None, None), |f| (f.name, f.arguments));
                    ToolCallDelta {
                        index: c.index,
                        id: c.id,
                        name,
                        arguments,
                    }
                })
                .collect();
            if content.is_some() || !tool_calls.is_empty() {
                events.push(StreamEvent::Delta { content, tool_calls });
            }
        }
        if let Some(usage) = self.usage {
            events.push(StreamEvent::Usage(usage.into()));
        }
        events
    }
}

fn extract_sse_api_error_message(event_json: &Value) -> Option<String> {
    let error = event_json.get("error")?;
    if let Some(message) = error.get("message").and_then(|value| value.as_str()) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("An error occurred during streaming".to_string())
}

fn truncate(body: &str) -> String {
    body.chars().take(ERROR_BODY_CHARS).collect()
}

/// HTTP 状态码到错误分类
fn classify_status(status: StatusCode, retry_after_ms: Option<u64>, body: &str) -> LlmError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body));
    match status.as_u16() {
        429 => LlmError::RateLimited { retry_after_ms },
        401 | 403 => LlmError::Auth(detail),
        400 | 404 | 422 => LlmError::InvalidRequest(detail),
        408 | 500..=599 => LlmError::TransientNetwork(detail),
        _ => LlmError::Unknown(detail),
    }
}

fn classify_transport(e: &reqwest::Error) -> LlmError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        LlmError::TransientNetwork(e.to_string())
    } else {
        LlmError::Unknown(e.to_string())
    }
}

/// Retry-After 以秒计（可为小数）；HTTP 日期格式不解析
fn parse_retry_after(value: &str) -> Option<u64> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| (secs * 1000.0) as u64)
}

/// OpenAI 兼容传输：持有 reqwest Client、base_url 与 API key
pub struct OpenAiTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    name: String,
    /// 非流式请求的整体超时；流式请求只约束到响应头，body 由适配器的空闲超时约束
    request_timeout: Duration,
}

impl OpenAiTransport {
    /// api_key 为空时返回配置错误
    pub fn new(
        base_url: Option<&str>,
        api_key: &str,
        request_timeout: Duration,
    ) -> Result<Self, AgentError> {
        if api_key.trim().is_empty() {
            return Err(AgentError::ConfigError(
                "API key is empty; set llm.api_key or the variable named by llm.api_key_env".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| AgentError::ConfigError(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.trim().to_string(),
            name: "openai".to_string(),
            request_timeout,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        let body = WireRequest::from_request(request, stream);
        let builder = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body);
        let response = if stream {
            tokio::time::timeout(self.request_timeout, builder.send())
                .await
                .map_err(|_| {
                    LlmError::TransientNetwork(format!(
                        "no response headers within {:?}",
                        self.request_timeout
                    ))
                })?
        } else {
            builder.timeout(self.request_timeout).send().await
        }
        .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(
            transport = %self.name,
            status = status.as_u16(),
            body = %truncate(&body),
            "model API returned error status"
        );
        Err(classify_status(status, retry_after, &body))
    }
}

#[async_trait]
impl ModelTransport for OpenAiTransport {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let response = self.post(request, false).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Unknown(format!("invalid response body: {e}")))?;
        parsed.into_chat_response()
    }

    async fn send_stream(&self, request: ChatRequest, sink: StreamSink) -> Result<(), LlmError> {
        let response = self.post(&request, true).await?;
        let mut events = response.bytes_stream().eventsource();

        while let Some(event) = events.next().await {
            let event =
                event.map_err(|e| LlmError::TransientNetwork(format!("SSE stream error: {e}")))?;
            let raw = event.data;
            tracing::trace!(transport = %self.name, data = %raw, "SSE");
            if raw == "[DONE]" {
                sink.done();
                return Ok(());
            }

            let event_json: Value = serde_json::from_str(&raw)
                .map_err(|e| LlmError::Unknown(format!("SSE parsing error: {e}, data: {raw}")))?;
            if let Some(message) = extract_sse_api_error_message(&event_json) {
                return Err(LlmError::Unknown(format!("SSE API error: {message}")));
            }
            let chunk: ChunkData = serde_json::from_value(event_json)
                .map_err(|e| LlmError::Unknown(format!("SSE data schema error: {e}, data: {raw}")))?;

            for stream_event in chunk.into_events() {
                if !sink.send(stream_event) {
                    tracing::debug!(transport = %self.name, "stream consumer gone, stopping");
                    return Ok(());
                }
            }
        }
        // 未收到 [DONE]：由适配器报告提前关闭
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
