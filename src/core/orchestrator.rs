//! Agent 编排器：对外的轮次入口
//!
//! 负责：为每个轮次加锁会话（串行化，不交叠）、施加整轮截止时间、驱动工具循环、
//! 记录 TurnRecord 与累计统计。只有 AgentError 会越过这一层。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};

use crate::core::{AgentError, AgentStatistics, Session, TurnRecord, TurnStatus};
use crate::llm::{ChunkCallback, ModelClient};
use crate::memory::{Conversation, ConversationConfig};
use crate::react::{run_turn_loop, TurnContext, TurnEvent, TurnProgress};
use crate::tools::ToolDispatcher;

/// 编排参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// 单轮模型调用上限
    pub max_tool_iterations: usize,
    /// 整轮截止时间
    pub turn_timeout: Duration,
    /// run_turn 是否走流式
    pub streaming: bool,
    /// 保留的 TurnRecord 条数
    pub max_turn_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 10,
            turn_timeout: Duration::from_secs(300),
            streaming: false,
            max_turn_history: 100,
        }
    }
}

/// 编排器：持有模型客户端、工具分发器与工具资源句柄
pub struct Orchestrator<R> {
    client: ModelClient,
    dispatcher: ToolDispatcher<R>,
    resource: Arc<R>,
    config: OrchestratorConfig,
    conversation_config: ConversationConfig,
    system_prompt: Option<String>,
    event_tx: Option<mpsc::UnboundedSender<TurnEvent>>,
    history: RwLock<VecDeque<TurnRecord>>,
    stats: RwLock<AgentStatistics>,
}

impl<R: Send + Sync + 'static> Orchestrator<R> {
    pub fn new(client: ModelClient, dispatcher: ToolDispatcher<R>, resource: Arc<R>) -> Self {
        Self {
            client,
            dispatcher,
            resource,
            config: OrchestratorConfig::default(),
            conversation_config: ConversationConfig::default(),
            system_prompt: None,
            event_tx: None,
            history: RwLock::new(VecDeque::new()),
            stats: RwLock::new(AgentStatistics::default()),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_conversation_config(mut self, config: ConversationConfig) -> Self {
        self.conversation_config = config;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 设置事件推送通道
    pub fn with_event_sender(mut self, tx: mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn client(&self) -> &ModelClient {
        &self.client
    }

    pub fn dispatcher(&self) -> &ToolDispatcher<R> {
        &self.dispatcher
    }

    /// 新建会话（带 system prompt 与会话级模型参数）
    pub fn new_session(&self) -> Session {
        let mut conversation = Conversation::new(self.conversation_config.clone());
        if let Some(prompt) = &self.system_prompt {
            conversation = conversation.with_system_prompt(prompt.clone());
        }
        Session::new(conversation)
    }

    /// 执行一轮；同一会话上已有轮次在跑时排队等待
    pub async fn run_turn(&self, session: &Session, input: &str) -> Result<String, AgentError> {
        let mut conversation = session.conversation.lock().await;
        self.execute(session, &mut conversation, input, self.config.streaming, None)
            .await
    }

    /// 执行一轮；同一会话上已有轮次在跑时立即返回 ConversationBusy
    pub async fn try_run_turn(&self, session: &Session, input: &str) -> Result<String, AgentError> {
        let mut conversation = session
            .conversation
            .try_lock()
            .map_err(|_| AgentError::ConversationBusy)?;
        self.execute(session, &mut conversation, input, self.config.streaming, None)
            .await
    }

    /// 流式执行一轮：文本块按到达顺序交给 on_chunk
    pub async fn stream_turn(
        &self,
        session: &Session,
        input: &str,
        on_chunk: &ChunkCallback<'_>,
    ) -> Result<String, AgentError> {
        let mut conversation = session.conversation.lock().await;
        self.execute(session, &mut conversation, input, true, Some(on_chunk))
            .await
    }

    /// 依次执行多条命令，每条一个结果；单条失败不影响后续
    pub async fn run_batch(
        &self,
        session: &Session,
        commands: &[String],
    ) -> Vec<Result<String, AgentError>> {
        let mut results = Vec::with_capacity(commands.len());
        for (i, command) in commands.iter().enumerate() {
            tracing::info!(index = i + 1, total = commands.len(), "batch command");
            results.push(self.run_turn(session, command).await);
        }
        results
    }

    async fn execute(
        &self,
        session: &Session,
        conversation: &mut Conversation,
        input: &str,
        streaming: bool,
        on_chunk: Option<&ChunkCallback<'_>>,
    ) -> Result<String, AgentError> {
        let cancel = session.supervisor().begin_turn();
        let started_at = Utc::now();
        let start = Instant::now();
        let mut progress = TurnProgress::default();
        tracing::info!(session = %session.id(), input_len = input.len(), streaming, "turn started");

        let ctx = TurnContext {
            client: &self.client,
            dispatcher: &self.dispatcher,
            resource: &self.resource,
            cancel: cancel.clone(),
            max_iterations: self.config.max_tool_iterations,
            streaming,
            on_chunk,
            event_tx: self.event_tx.as_ref(),
        };
        let deadline = self.config.turn_timeout;
        let result = match tokio::time::timeout(
            deadline,
            run_turn_loop(&ctx, conversation, input, &mut progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                // 丢弃在途的模型调用与工具；取消信号交给仍在运行的子任务
                cancel.cancel();
                if let Some(tx) = &self.event_tx {
                    let _ = tx.send(TurnEvent::Error {
                        text: format!("turn deadline exceeded after {deadline:?}"),
                    });
                }
                Err(AgentError::TurnTimeout(deadline))
            }
        };
        session.supervisor().end_turn();

        let record = TurnRecord {
            id: uuid::Uuid::new_v4().to_string(),
            command: input.to_string(),
            status: if result.is_ok() {
                TurnStatus::Completed
            } else {
                TurnStatus::Failed
            },
            result: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
            iterations: progress.iterations,
            tool_calls: progress.tool_calls,
            started_at,
            finished_at: Utc::now(),
            execution_time: start.elapsed(),
        };
        match &result {
            Ok(_) => tracing::info!(
                turn_id = %record.id,
                iterations = record.iterations,
                tool_calls = record.tool_calls,
                elapsed_ms = record.execution_time.as_millis() as u64,
                "turn completed"
            ),
            Err(e) => tracing::error!(
                turn_id = %record.id,
                iterations = record.iterations,
                loop_exceeded = e.is_loop_exceeded(),
                api_failure = e.is_api_failure(),
                error = %e,
                "turn failed"
            ),
        }
        self.record(record).await;
        result
    }

    async fn record(&self, record: TurnRecord) {
        self.stats.write().await.record(&record);
        let mut history = self.history.write().await;
        history.push_back(record);
        while history.len() > self.config.max_turn_history {
            history.pop_front();
        }
    }

    pub async fn statistics(&self) -> AgentStatistics {
        self.stats.read().await.clone()
    }

    /// 最近 n 条记录，最新在前
    pub async fn recent_turns(&self, n: usize) -> Vec<TurnRecord> {
        self.history.read().await.iter().rev().take(n).cloned().collect()
    }

    pub async fn reset_statistics(&self) {
        *self.stats.write().await = AgentStatistics::default();
        tracing::info!("statistics reset");
    }

    /// 清空轮次记录与会话历史（保留 system 消息）
    pub async fn clear_history(&self, session: &Session) {
        session.clear().await;
        self.history.write().await.clear();
        tracing::info!(session = %session.id(), "history cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, RetryConfig, ScriptedTransport};
    use crate::memory::{Message, Role, ToolCall};
    use crate::tools::{EchoTool, ToolRegistry};

    fn orchestrator(transport: Arc<ScriptedTransport>) -> Orchestrator<()> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let client = ModelClient::new(transport).with_retry(RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        });
        Orchestrator::new(client, ToolDispatcher::new(registry, 5), Arc::new(()))
            .with_system_prompt("You are a test agent.")
    }

    #[tokio::test]
    async fn test_run_turn_records_statistics() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(Message::assistant("first"))
                .fail(LlmError::Auth("revoked".into())),
        );
        let orch = orchestrator(transport);
        let session = orch.new_session();

        assert_eq!(orch.run_turn(&session, "one").await.unwrap(), "first");
        let err = orch.run_turn(&session, "two").await.unwrap_err();
        assert!(err.is_api_failure());

        let stats = orch.statistics().await;
        assert_eq!((stats.total_turns, stats.completed_turns, stats.failed_turns), (2, 1, 1));
        assert_eq!(stats.success_rate(), 50.0);

        let recent = orch.recent_turns(5).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].command, "two");
        assert_eq!(recent[0].status, TurnStatus::Failed);
        assert!(recent[0].error.as_deref().unwrap_or("").contains("revoked"));
        assert_eq!(recent[1].result.as_deref(), Some("first"));

        orch.reset_statistics().await;
        assert_eq!(orch.statistics().await.total_turns, 0);
        assert_eq!(orch.recent_turns(5).await.len(), 2);
    }

    #[tokio::test]
    async fn test_fatal_api_commits_no_assistant_content() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(Message::assistant_with_tool_calls(
                    None,
                    vec![ToolCall::new("c1", "echo", r#"{"text":"x"}"#)],
                ))
                .fail(LlmError::InvalidRequest("context too long".into())),
        );
        let orch = orchestrator(transport);
        let session = orch.new_session();
        let err = orch.run_turn(&session, "go").await.unwrap_err();
        assert!(matches!(err, AgentError::FatalApi { attempts: 1, .. }), "{err:?}");

        // 第一轮迭代的 assistant + tool 已写入，失败的那次调用没有留下内容
        let roles: Vec<Role> = session.messages().await.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool]);
    }

    #[tokio::test]
    async fn test_turn_timeout_discards_in_flight_work() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .with_latency(Duration::from_millis(200))
                .reply(Message::assistant("too late")),
        );
        let orch = orchestrator(transport).with_config(OrchestratorConfig {
            turn_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let session = orch.new_session();
        let err = orch.run_turn(&session, "slow").await.unwrap_err();
        assert!(matches!(err, AgentError::TurnTimeout(_)), "{err:?}");
        assert!(!session.supervisor().has_active_turn());
        assert_eq!(session.history_len().await, 2);
    }

    #[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
    struct NoArgs {}

    /// 睡眠远超整轮截止时间的工具
    struct SleepyTool;

    #[async_trait::async_trait]
    impl crate::tools::Tool<()> for SleepyTool {
        type Args = NoArgs;

        fn name(&self) -> &str {
            "sleepy"
        }

        fn description(&self) -> &str {
            "Sleeps for half a second"
        }

        async fn call(
            &self,
            _args: NoArgs,
            _ctx: &crate::tools::ToolContext<()>,
        ) -> Result<String, crate::tools::ToolError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok("woke up".to_string())
        }
    }

    #[tokio::test]
    async fn test_turn_timeout_during_tool_dispatch_commits_nothing() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(Message::assistant_with_tool_calls(
                    None,
                    vec![ToolCall::new("c1", "sleepy", "{}")],
                ))
                .reply(Message::assistant("never reached")),
        );
        let mut registry = ToolRegistry::new();
        registry.register(SleepyTool);
        let orch = Orchestrator::new(
            ModelClient::new(transport.clone()),
            ToolDispatcher::new(registry, 5),
            Arc::new(()),
        )
        .with_system_prompt("sys")
        .with_config(OrchestratorConfig {
            turn_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let session = orch.new_session();

        let err = orch.run_turn(&session, "nap").await.unwrap_err();
        assert!(matches!(err, AgentError::TurnTimeout(d) if d == Duration::from_millis(100)), "{err:?}");
        assert_eq!(transport.calls(), 1);

        // 在途工具结果作废：没有 assistant 也没有 tool 消息
        let roles: Vec<Role> = session.messages().await.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User]);

        let recent = orch.recent_turns(1).await;
        assert_eq!(recent[0].status, TurnStatus::Failed);
        assert_eq!(recent[0].iterations, 1);
        assert_eq!(recent[0].tool_calls, 0);
        assert!(recent[0].error.as_deref().unwrap_or("").contains("deadline"));
        assert_eq!(orch.statistics().await.failed_turns, 1);

        // 轮次令牌已释放
        assert!(!session.supervisor().has_active_turn());
    }

    #[tokio::test]
    async fn test_batch_and_clear_history() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(Message::assistant("a"))
                .reply(Message::assistant("b")),
        );
        let orch = orchestrator(transport);
        let session = orch.new_session();
        let results = orch
            .run_batch(&session, &["x".to_string(), "y".to_string(), "z".to_string()])
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_deref().ok(), Some("a"));
        assert_eq!(results[1].as_deref().ok(), Some("b"));
        assert!(results[2].is_err());
        assert_eq!(session.history_len().await, 1 + 2 + 2 + 1);

        orch.clear_history(&session).await;
        assert_eq!(session.history_len().await, 1);
        assert!(orch.recent_turns(10).await.is_empty());
        assert_eq!(orch.statistics().await.total_turns, 3);
    }
}
