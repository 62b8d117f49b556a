//! 轮次过程事件：用于流式展示阶段、模型调用、工具调用、观察与回复

use serde::Serialize;

use crate::core::TurnPhase;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 状态机阶段变化
    Phase { phase: TurnPhase },
    /// 第几次模型调用
    ModelCall { iteration: usize, max_iterations: usize },
    /// 调用工具（原始参数文本）
    ToolCall {
        id: String,
        tool: String,
        arguments: String,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        id: String,
        tool: String,
        preview: String,
        is_error: bool,
    },
    /// 回复的一小段（流式输出）
    MessageChunk { text: String },
    /// 最终回复结束
    MessageDone,
    /// Token 使用统计（本轮增量 + 累计）
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
        cumulative_total: u64,
    },
    /// 错误
    Error { text: String },
}
