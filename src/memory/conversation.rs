//! 短期记忆：对话历史
//!
//! 只追加的消息日志（创建顺序即唯一顺序）；发往模型前在副本上按 max_history 裁剪，
//! 原始历史保留用于审计。system 消息若存在必为首条，且永不被裁剪或清空。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 模型发起的一次工具调用；arguments 为原始 JSON 文本，在分发边界才解析
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(content.into()))
    }

    /// 携带 tool_calls 的 assistant 消息；content 可为空（模型只请求工具时）
    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, Some(content.into()))
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 会话级模型参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// 发往模型的非 system 消息上限（上下文窗口）
    pub max_history: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: None,
            max_history: 20,
        }
    }
}

/// 裁剪策略：保留 system（若有）+ 最新的 max_history 条非 system 消息。
/// 裁剪点之后开头的 tool 消息（其 assistant 已被裁掉）一并丢弃，保证每条 tool 消息都能对上前一条 assistant。
///
/// 注意：若单条 assistant 请求的工具数不少于 max_history，最新一批结果会整体落在裁剪点之后被丢弃，
/// 模型看不到本批结果，只会重复请求直至 LoopExceeded。此时记一条 warn；max_history 应大于单次工具调用数。
pub fn trim_messages(messages: &[Message], max_history: usize) -> Vec<Message> {
    let trimmed = trim_with_report(messages, max_history);
    if trimmed.dropped_latest_results {
        tracing::warn!(
            max_history,
            "context window smaller than the latest tool batch; its results were trimmed away"
        );
    }
    trimmed.messages
}

struct Trimmed {
    messages: Vec<Message>,
    /// 丢弃的孤立 tool 消息一直延伸到末尾：最新一批工具结果全部不可见
    dropped_latest_results: bool,
}

fn trim_with_report(messages: &[Message], max_history: usize) -> Trimmed {
    let (system, rest) = match messages.split_first() {
        Some((first, rest)) if first.role == Role::System => (Some(first), rest),
        _ => (None, messages),
    };

    let window = &rest[rest.len().saturating_sub(max_history)..];
    let orphaned = window.iter().take_while(|m| m.role == Role::Tool).count();
    let tail = &window[orphaned..];

    let mut out = Vec::with_capacity(tail.len() + 1);
    out.extend(system.cloned());
    out.extend_from_slice(tail);
    Trimmed {
        messages: out,
        dropped_latest_results: orphaned > 0 && tail.is_empty(),
    }
}

/// 一次会话：id + 只追加的消息序列 + 模型参数
#[derive(Clone, Debug)]
pub struct Conversation {
    id: String,
    messages: Vec<Message>,
    config: ConversationConfig,
}

impl Conversation {
    pub fn new(config: ConversationConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            messages: Vec::new(),
            config,
        }
    }

    /// 构造阶段设置 system prompt（替换已有的 system 消息）
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        if self.system_message().is_some() {
            self.messages.remove(0);
        }
        self.messages.insert(0, Message::system(prompt));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn system_message(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role == Role::System)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 追加一条消息；拒绝非首位的 system 消息，以及对不上前一条 assistant tool_calls 的 tool 消息
    pub fn push(&mut self, msg: Message) -> Result<(), AgentError> {
        match msg.role {
            Role::System if !self.messages.is_empty() => {
                return Err(AgentError::InvalidMessage(
                    "system message must be the first message".to_string(),
                ));
            }
            Role::Tool => self.check_tool_reply(&msg)?,
            _ => {}
        }
        self.messages.push(msg);
        Ok(())
    }

    fn check_tool_reply(&self, msg: &Message) -> Result<(), AgentError> {
        let id = msg.tool_call_id.as_deref().ok_or_else(|| {
            AgentError::InvalidMessage("tool message without tool_call_id".to_string())
        })?;
        let answered = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role != Role::Tool)
            .is_some_and(|m| m.role == Role::Assistant && m.tool_calls.iter().any(|c| c.id == id));
        if answered {
            Ok(())
        } else {
            Err(AgentError::InvalidMessage(format!(
                "tool result {id} does not answer the preceding assistant message"
            )))
        }
    }

    /// 发往模型的裁剪副本，不修改历史
    pub fn outgoing_messages(&self) -> Vec<Message> {
        trim_messages(&self.messages, self.config.max_history)
    }

    /// 清空对话，保留 system 消息
    pub fn clear(&mut self) {
        let keep = usize::from(self.system_message().is_some());
        self.messages.truncate(keep);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
