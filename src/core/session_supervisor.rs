//! 会话监管：生命周期、中断管理
//!
//! Session 独占持有一份 Conversation（tokio Mutex，同一时刻只允许一个轮次在跑）；
//! SessionSupervisor 持有会话级 CancellationToken，并为每个轮次派生子 token，Cancel 只打断当前轮次。

use std::sync::{Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::memory::{Conversation, Message};

/// 会话级生命周期管理：会话取消令牌与当前轮次令牌
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    /// 会话结束时触发，所有轮次随之取消
    cancel_token: CancellationToken,
    /// 在跑轮次的令牌
    turn_token: Mutex<Option<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 结束整个会话
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 开始一个轮次，返回该轮次专用的子 token
    pub fn begin_turn(&self) -> CancellationToken {
        let token = self.child_token();
        *self.turn() = Some(token.clone());
        token
    }

    pub fn end_turn(&self) {
        self.turn().take();
    }

    /// 取消当前轮次（用户 Stop）；没有在跑的轮次时返回 false
    pub fn cancel_turn(&self) -> bool {
        match self.turn().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn has_active_turn(&self) -> bool {
        self.turn().is_some()
    }

    fn turn(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.turn_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 一次会话：独占的对话历史 + 监管器
#[derive(Debug)]
pub struct Session {
    id: String,
    pub(crate) conversation: AsyncMutex<Conversation>,
    supervisor: SessionSupervisor,
}

impl Session {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            id: conversation.id().to_string(),
            conversation: AsyncMutex::new(conversation),
            supervisor: SessionSupervisor::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// 历史消息条数（含 system）；有轮次在跑时等待其结束
    pub async fn history_len(&self) -> usize {
        self.conversation.lock().await.len()
    }

    /// 历史快照
    pub async fn messages(&self) -> Vec<Message> {
        self.conversation.lock().await.messages().to_vec()
    }

    /// 清空对话，保留 system 消息
    pub async fn clear(&self) {
        self.conversation.lock().await.clear();
    }

    /// 是否有轮次正持有会话
    pub fn is_busy(&self) -> bool {
        self.conversation.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ConversationConfig;

    #[test]
    fn test_turn_tokens_are_independent() {
        let supervisor = SessionSupervisor::new();
        assert!(!supervisor.cancel_turn());

        let first = supervisor.begin_turn();
        assert!(supervisor.has_active_turn());
        assert!(supervisor.cancel_turn());
        assert!(first.is_cancelled());
        supervisor.end_turn();

        let second = supervisor.begin_turn();
        assert!(!second.is_cancelled());
        supervisor.cancel();
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn test_session_clear_keeps_system() {
        let mut conv = Conversation::new(ConversationConfig::default()).with_system_prompt("sys");
        conv.push(Message::user("hi")).unwrap();
        let session = Session::new(conv);
        assert_eq!(session.history_len().await, 2);
        assert!(!session.is_busy());
        session.clear().await;
        assert_eq!(session.history_len().await, 1);
        assert_eq!(session.messages().await[0].text(), "sys");
    }
}
