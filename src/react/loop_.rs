//! 工具循环主流程
//!
//! 显式有界状态机：RECEIVED → MODEL_CALL → {TOOLS_REQUESTED → DISPATCH → MODEL_CALL}* → DONE | FAILED。
//! 每次进入 MODEL_CALL 前检查计数，达到 max_iterations 即以 LoopExceeded 失败；
//! 工具失败不会进入 FAILED，而是作为 tool 消息写回，由模型自行恢复。
//! 带 tool_calls 的 assistant 消息在分发完成后与全部结果一起写入历史，半途中止的轮次不会留下未应答的调用。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, TurnPhase};
use crate::llm::{ChunkCallback, ModelClient};
use crate::memory::{Conversation, Message};
use crate::react::TurnEvent;
use crate::tools::ToolDispatcher;

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 单轮执行所需的协作者
pub struct TurnContext<'a, R> {
    pub client: &'a ModelClient,
    pub dispatcher: &'a ToolDispatcher<R>,
    pub resource: &'a Arc<R>,
    pub cancel: CancellationToken,
    pub max_iterations: usize,
    pub streaming: bool,
    /// 可选：流式文本块回调
    pub on_chunk: Option<&'a ChunkCallback<'a>>,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a mpsc::UnboundedSender<TurnEvent>>,
}

/// 轮次进度；失败时调用方仍可读取
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnProgress {
    pub phase: Option<TurnPhase>,
    pub iterations: usize,
    pub tool_calls: usize,
}

fn send_event(tx: Option<&mpsc::UnboundedSender<TurnEvent>>, ev: TurnEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 状态机内部状态；待分发的 assistant 消息随状态携带
enum Step {
    Received,
    ModelCall,
    ToolsRequested(Message),
    Dispatch(Message),
    Done(String),
}

impl Step {
    fn phase(&self) -> TurnPhase {
        match self {
            Step::Received => TurnPhase::Received,
            Step::ModelCall => TurnPhase::ModelCall,
            Step::ToolsRequested(_) => TurnPhase::ToolsRequested,
            Step::Dispatch(_) => TurnPhase::Dispatch,
            Step::Done(_) => TurnPhase::Done,
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", text.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 执行一轮：追加用户输入，循环调用模型与工具直到最终回复或失败
pub async fn run_turn_loop<R: Send + Sync + 'static>(
    ctx: &TurnContext<'_, R>,
    conversation: &mut Conversation,
    user_input: &str,
    progress: &mut TurnProgress,
) -> Result<String, AgentError> {
    let result = drive(ctx, conversation, user_input, progress).await;
    if let Err(e) = &result {
        progress.phase = Some(TurnPhase::Failed);
        send_event(ctx.event_tx, TurnEvent::Phase { phase: TurnPhase::Failed });
        send_event(ctx.event_tx, TurnEvent::Error { text: e.to_string() });
    }
    result
}

async fn drive<R: Send + Sync + 'static>(
    ctx: &TurnContext<'_, R>,
    conversation: &mut Conversation,
    user_input: &str,
    progress: &mut TurnProgress,
) -> Result<String, AgentError> {
    let tools = ctx.dispatcher.specs();
    let (init_prompt, init_completion, _) = ctx.client.token_usage();
    let forward = |chunk: &str| {
        if let Some(callback) = ctx.on_chunk {
            callback(chunk);
        }
        send_event(ctx.event_tx, TurnEvent::MessageChunk { text: chunk.to_string() });
    };

    let mut step = Step::Received;
    loop {
        progress.phase = Some(step.phase());
        send_event(ctx.event_tx, TurnEvent::Phase { phase: step.phase() });

        step = match step {
            Step::Received => {
                conversation.push(Message::user(user_input))?;
                Step::ModelCall
            }
            Step::ModelCall => {
                if ctx.cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                if progress.iterations >= ctx.max_iterations {
                    tracing::warn!(
                        max_iterations = ctx.max_iterations,
                        "model keeps requesting tools, giving up"
                    );
                    return Err(AgentError::LoopExceeded {
                        max_iterations: ctx.max_iterations,
                    });
                }
                progress.iterations += 1;
                send_event(ctx.event_tx, TurnEvent::ModelCall {
                    iteration: progress.iterations,
                    max_iterations: ctx.max_iterations,
                });

                let on_chunk: Option<&ChunkCallback<'_>> = if ctx.streaming { Some(&forward) } else { None };
                let reply = ctx
                    .client
                    .chat(conversation, &tools, ctx.streaming, on_chunk, &ctx.cancel)
                    .await?;

                if reply.has_tool_calls() {
                    Step::ToolsRequested(reply)
                } else {
                    let text = reply.text().to_string();
                    conversation.push(reply)?;
                    Step::Done(text)
                }
            }
            Step::ToolsRequested(reply) => {
                for call in &reply.tool_calls {
                    tracing::info!(tool = %call.name, call_id = %call.id, "tool requested");
                    send_event(ctx.event_tx, TurnEvent::ToolCall {
                        id: call.id.clone(),
                        tool: call.name.clone(),
                        arguments: call.arguments.clone(),
                    });
                }
                Step::Dispatch(reply)
            }
            Step::Dispatch(reply) => {
                let results = ctx
                    .dispatcher
                    .dispatch_all(&reply.tool_calls, ctx.resource, &ctx.cancel)
                    .await;
                // 截止时间已到：结果作废，不写入历史
                if ctx.cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                progress.tool_calls += results.len();

                let names: Vec<String> = reply.tool_calls.iter().map(|c| c.name.clone()).collect();
                conversation.push(reply)?;
                for (result, tool) in results.into_iter().zip(names) {
                    if result.is_error {
                        tracing::warn!(tool = %tool, call_id = %result.tool_call_id, error = %result.content, "tool failed, returning error to model");
                    }
                    send_event(ctx.event_tx, TurnEvent::Observation {
                        id: result.tool_call_id.clone(),
                        tool,
                        preview: preview(&result.content),
                        is_error: result.is_error,
                    });
                    conversation.push(result.into_message())?;
                }
                Step::ModelCall
            }
            Step::Done(text) => {
                send_event(ctx.event_tx, TurnEvent::MessageDone);
                let (prompt, completion, total) = ctx.client.token_usage();
                let prompt = prompt.saturating_sub(init_prompt);
                let completion = completion.saturating_sub(init_completion);
                send_event(ctx.event_tx, TurnEvent::TokenUsage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: prompt + completion,
                    cumulative_total: total,
                });
                return Ok(text);
            }
        };
    }
}
