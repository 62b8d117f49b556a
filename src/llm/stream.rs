//! 流适配器：推送转拉取
//!
//! 生产端（网络读循环）在独立任务中经 StreamSink 推送事件，先到的事件缓存在无界 FIFO 中；
//! 消费端按需拉取，等待时受空闲超时与取消令牌约束。适配器被丢弃或中止时，生产任务随之 abort。
//! 只向消费端暴露文本块；tool_call 片段单独累积，完整后由 ModelClient 取走。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::traits::StreamItem;
use crate::llm::{ChatRequest, LlmError, ModelTransport, StreamEvent, StreamSink, ToolCallDelta, Usage};
use crate::memory::ToolCall;

/// 流的终止性错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error(transparent)]
    Transport(#[from] LlmError),

    #[error("stream idle for {0:?}")]
    Timeout(Duration),

    #[error("stream cancelled")]
    Cancelled,

    #[error("stream closed without completion marker")]
    Closed,
}

impl StreamError {
    /// 映射为本轮的致命错误；attempts 为已用的打开次数
    pub fn into_agent_error(self, attempts: u32) -> AgentError {
        match self {
            StreamError::Transport(source) => AgentError::FatalApi { attempts, source },
            StreamError::Timeout(d) => AgentError::StreamTimeout(d),
            StreamError::Cancelled => AgentError::StreamCancelled,
            StreamError::Closed => AgentError::StreamClosed,
        }
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// 按 index 拼接 tool_call 片段：id / name 取最后一次出现的值，arguments 依次追加
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn apply(&mut self, delta: ToolCallDelta) {
        let entry = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|s| !s.is_empty()) {
            entry.id = Some(id);
        }
        if let Some(name) = delta.name.filter(|s| !s.is_empty()) {
            entry.name = Some(name);
        }
        if let Some(fragment) = delta.arguments {
            entry.arguments.push_str(&fragment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// 按 index 升序得到完整调用；缺失 id 时以 index 补齐
    pub fn into_calls(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .map(|(index, call)| ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name.unwrap_or_default(),
                arguments: call.arguments,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Completed,
    Failed,
}

/// 单消费者、单次遍历、有限的文本块序列
pub struct StreamAdapter {
    rx: mpsc::UnboundedReceiver<StreamItem>,
    producer: JoinHandle<()>,
    idle_timeout: Duration,
    cancel: CancellationToken,
    peeked: Option<StreamEvent>,
    tool_calls: ToolCallAccumulator,
    usage: Option<Usage>,
    state: StreamState,
}

impl StreamAdapter {
    /// 启动生产任务：transport.send_stream 的 Err 作为错误信号推入缓冲
    pub fn spawn(
        transport: Arc<dyn ModelTransport>,
        request: ChatRequest,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = StreamSink::new(tx);
        let producer = tokio::spawn(async move {
            if let Err(e) = transport.send_stream(request, sink.clone()).await {
                sink.fail(e);
            }
        });
        Self {
            rx,
            producer,
            idle_timeout,
            cancel,
            peeked: None,
            tool_calls: ToolCallAccumulator::default(),
            usage: None,
            state: StreamState::Open,
        }
    }

    /// 等待第一个事件但不消费它；用于在尚未向消费端交付任何内容前判断是否可重试
    pub async fn prime(&mut self) -> Result<(), StreamError> {
        if self.state != StreamState::Open || self.peeked.is_some() {
            return Ok(());
        }
        match self.recv_event().await {
            Ok(Some(event)) => {
                self.peeked = Some(event);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.state = StreamState::Failed;
                Err(e)
            }
        }
    }

    /// 拉取下一个文本块；完成后返回 None，错误只返回一次
    pub async fn next_chunk(&mut self) -> Option<Result<String, StreamError>> {
        loop {
            if self.state != StreamState::Open {
                return None;
            }
            let event = match self.peeked.take() {
                Some(event) => event,
                None => match self.recv_event().await {
                    Ok(Some(event)) => event,
                    Ok(None) => return None,
                    Err(e) => {
                        self.state = StreamState::Failed;
                        return Some(Err(e));
                    }
                },
            };
            match event {
                StreamEvent::Delta { content, tool_calls } => {
                    for delta in tool_calls {
                        self.tool_calls.apply(delta);
                    }
                    if let Some(text) = content.filter(|t| !t.is_empty()) {
                        return Some(Ok(text));
                    }
                }
                StreamEvent::Usage(usage) => self.usage = Some(usage),
                StreamEvent::Done => self.complete(),
            }
        }
    }

    /// Ok(None) 表示收到完成标记
    async fn recv_event(&mut self) -> Result<Option<StreamEvent>, StreamError> {
        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.shutdown();
                return Err(StreamError::Cancelled);
            }
            r = tokio::time::timeout(self.idle_timeout, self.rx.recv()) => r,
        };
        match received {
            Err(_) => {
                self.shutdown();
                Err(StreamError::Timeout(self.idle_timeout))
            }
            Ok(None) => Err(StreamError::Closed),
            Ok(Some(Err(e))) => {
                self.shutdown();
                Err(StreamError::Transport(e))
            }
            Ok(Some(Ok(StreamEvent::Done))) => {
                self.complete();
                Ok(None)
            }
            Ok(Some(Ok(event))) => Ok(Some(event)),
        }
    }

    fn complete(&mut self) {
        self.state = StreamState::Completed;
        self.shutdown();
    }

    /// 终止生产任务并关闭缓冲，之后的推送全部失败
    fn shutdown(&mut self) {
        self.producer.abort();
        self.rx.close();
    }

    pub fn is_completed(&self) -> bool {
        self.state == StreamState::Completed
    }

    /// 取走已拼接完整的 tool_calls（应在完成后调用）
    pub fn take_tool_calls(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.tool_calls).into_calls()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// 转为 futures Stream；丢弃该 Stream 即放弃消费
    pub fn into_stream(self) -> impl Stream<Item = Result<String, StreamError>> + Send {
        futures_util::stream::unfold(self, |mut adapter| async move {
            adapter.next_chunk().await.map(|item| (item, adapter))
        })
    }
}

impl Drop for StreamAdapter {
    fn drop(&mut self) {
        self.producer.abort();
    }
}
