//! 记忆层：会话消息日志与上下文窗口裁剪

pub mod conversation;

pub use conversation::{trim_messages, Conversation, ConversationConfig, Message, Role, ToolCall};
