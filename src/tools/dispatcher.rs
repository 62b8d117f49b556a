//! 工具分发器
//!
//! 持有 ToolRegistry、单次调用超时与并发上限。一个分发步骤内的全部调用并发执行，
//! 结果按声明顺序返回（与完成顺序无关）；任何失败（未知工具、参数畸形、handler 报错、超时、panic）
//! 都转为 is_error 的 ToolResult，不会中断本轮。每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::memory::{Message, ToolCall};
use crate::tools::schema::preview;
use crate::tools::{ToolContext, ToolRegistry, ToolSpec};

/// 工具调用失败的原因；最终都变成回传给模型的错误结果
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("{0}")]
    Execution(String),

    #[error("path escapes workspace: {0}")]
    PathEscape(String),

    #[error("tool {tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("tool call cancelled")]
    Cancelled,

    #[error("tool {0} panicked")]
    Panicked(String),
}

impl ToolError {
    fn outcome(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::InvalidArguments { .. } => "invalid_arguments",
            ToolError::Timeout { .. } => "timeout",
            ToolError::Cancelled => "cancelled",
            ToolError::Panicked(_) => "panic",
            ToolError::Execution(_) | ToolError::PathEscape(_) => "error",
        }
    }
}

/// 单次调用结果，按 tool_call_id 与请求对应
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }

    /// 转为 role=tool 的消息；错误内容原样交给模型
    pub fn into_message(self) -> Message {
        Message::tool(self.tool_call_id, self.content)
    }
}

/// 工具分发器：对每次调用施加超时与并发上限，并把失败收敛为错误结果
pub struct ToolDispatcher<R> {
    registry: ToolRegistry<R>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl<R: Send + Sync + 'static> ToolDispatcher<R> {
    pub fn new(registry: ToolRegistry<R>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            permits: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 同时执行的 handler 上限（至少 1）
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        self
    }

    pub fn registry(&self) -> &ToolRegistry<R> {
        &self.registry
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 执行单个调用；永不失败，失败原因写入 ToolResult
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        resource: Arc<R>,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let start = Instant::now();
        let outcome = self.execute(call, resource, cancel).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": outcome.is_ok(),
            "outcome": outcome.as_ref().err().map_or("ok", ToolError::outcome),
            "duration_ms": duration_ms,
            "args_preview": preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match outcome {
            Ok(content) => ToolResult::ok(&call.id, content),
            Err(e) => ToolResult::error(&call.id, e.to_string()),
        }
    }

    /// 并发执行一批调用，结果顺序与 calls 一致
    pub async fn dispatch_all(
        &self,
        calls: &[ToolCall],
        resource: &Arc<R>,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        join_all(
            calls
                .iter()
                .map(|call| self.dispatch(call, Arc::clone(resource), cancel)),
        )
        .await
    }

    async fn execute(
        &self,
        call: &ToolCall,
        resource: Arc<R>,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| ToolError::Cancelled)?,
        };

        let ctx = ToolContext {
            resource,
            cancel: cancel.child_token(),
            call_id: call.id.clone(),
        };
        let invocation = AssertUnwindSafe(tool.invoke(&call.arguments, &ctx)).catch_unwind();

        // cancel 时丢弃 invocation，handler 在下一个 await 点停止
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            finished = tokio::time::timeout(self.timeout, invocation) => match finished {
                Err(_) => Err(ToolError::Timeout {
                    tool: call.name.clone(),
                    after: self.timeout,
                }),
                Ok(Err(_panic)) => {
                    tracing::error!(tool = %call.name, call_id = %call.id, "tool handler panicked");
                    Err(ToolError::Panicked(call.name.clone()))
                }
                Ok(Ok(result)) => result,
            },
        }
    }
}
