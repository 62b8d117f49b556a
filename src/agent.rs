//! Headless Agent 运行时
//!
//! build_orchestrator 按配置装配传输层、重试策略、工具注册表与工作目录沙箱；
//! spawn_agent 启动后台任务消费 Command：Submit 按到达顺序排队执行，Cancel 只打断在跑的轮次，
//! Clear 排在已提交的轮次之后执行。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, Provider};
use crate::core::{AgentError, Orchestrator};
use crate::llm::{deepseek_transport, MockTransport, ModelClient, ModelTransport, OpenAiTransport};
use crate::tools::{EchoTool, ListFilesTool, ReadFileTool, SafeFs, ToolDispatcher, ToolRegistry};

/// 发往运行时的用户命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 提交用户输入，触发一轮工具循环
    Submit(String),
    /// 取消当前轮次（Stop generating）
    Cancel,
    /// 清空对话（保留 system 消息）与轮次记录
    Clear,
    /// 退出运行时
    Quit,
}

/// 运行时输出
#[derive(Debug)]
pub enum AgentOutput {
    /// 一轮结束（成功或失败）
    Reply {
        input: String,
        result: Result<String, AgentError>,
    },
    Cleared,
}

/// 运行时句柄：命令发送端、输出接收端、后台任务
pub struct AgentHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub outputs: mpsc::UnboundedReceiver<AgentOutput>,
    pub task: JoinHandle<()>,
}

enum Job {
    Turn(String),
    Clear,
}

/// 根据配置选择模型后端（Mock / OpenAI 兼容 / DeepSeek）
pub fn create_transport(cfg: &AppConfig) -> Result<Arc<dyn ModelTransport>, AgentError> {
    let timeout = cfg.llm.request_timeout();
    let base = cfg.llm.base_url.as_deref();
    match cfg.llm.provider {
        Provider::Mock => {
            tracing::info!("Using Mock LLM");
            Ok(Arc::new(MockTransport))
        }
        Provider::Openai => {
            let key = require_key(cfg)?;
            tracing::info!(model = %cfg.llm.model_name(), "Using OpenAI-compatible LLM");
            Ok(Arc::new(OpenAiTransport::new(base, &key, timeout)?))
        }
        Provider::Deepseek => {
            let key = require_key(cfg)?;
            tracing::info!(model = %cfg.llm.model_name(), "Using DeepSeek LLM");
            Ok(Arc::new(deepseek_transport(base, &key, timeout)?))
        }
    }
}

fn require_key(cfg: &AppConfig) -> Result<String, AgentError> {
    cfg.llm.resolve_api_key().ok_or_else(|| {
        AgentError::ConfigError(format!(
            "no API key for provider {:?}; set llm.api_key or llm.api_key_env",
            cfg.llm.provider
        ))
    })
}

/// 工作目录：配置 > 当前目录下的 workspace；不存在时创建
fn workspace_root(cfg: &AppConfig) -> Result<PathBuf, AgentError> {
    let root = match &cfg.app.workspace_root {
        Some(path) => path.clone(),
        None => std::env::current_dir()
            .map_err(|e| AgentError::ConfigError(format!("cannot resolve current dir: {e}")))?
            .join("workspace"),
    };
    std::fs::create_dir_all(&root).map_err(|e| {
        AgentError::ConfigError(format!("cannot create workspace {}: {e}", root.display()))
    })?;
    Ok(root)
}

/// 按配置装配编排器：传输层 + 重试 + 工具（echo、read_file、list_files）+ 沙箱
pub fn build_orchestrator(cfg: &AppConfig) -> Result<Orchestrator<SafeFs>, AgentError> {
    cfg.validate()?;
    let transport = create_transport(cfg)?;
    let client = ModelClient::new(transport)
        .with_retry(cfg.retry_config())
        .with_idle_timeout(Duration::from_secs(cfg.llm.stream.idle_timeout_secs));

    let fs = SafeFs::new(workspace_root(cfg)?);
    tracing::info!(workspace = %fs.root().display(), "workspace ready");

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(ReadFileTool);
    registry.register(ListFilesTool);
    tracing::debug!(tools = %registry.to_schema_json(), "tools registered");
    let dispatcher = ToolDispatcher::new(registry, cfg.tools.tool_timeout_secs)
        .with_max_concurrent(cfg.tools.max_concurrent);

    Ok(Orchestrator::new(client, dispatcher, Arc::new(fs))
        .with_config(cfg.orchestrator_config())
        .with_conversation_config(cfg.conversation_config())
        .with_system_prompt(cfg.agent.system_prompt.clone()))
}

/// 启动后台运行时：单会话，命令串行消费
pub fn spawn_agent<R: Send + Sync + 'static>(orchestrator: Arc<Orchestrator<R>>) -> AgentHandle {
    let session = Arc::new(orchestrator.new_session());
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<AgentOutput>();
    let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();

    let worker = {
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                let output = match job {
                    Job::Turn(input) => {
                        let result = orchestrator.run_turn(&session, &input).await;
                        AgentOutput::Reply { input, result }
                    }
                    Job::Clear => {
                        orchestrator.clear_history(&session).await;
                        AgentOutput::Cleared
                    }
                };
                if out_tx.send(output).is_err() {
                    break;
                }
            }
        })
    };

    let task = tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Submit(input) => {
                    if session.is_busy() {
                        tracing::debug!("turn in flight, input queued");
                    }
                    if job_tx.send(Job::Turn(input)).is_err() {
                        break;
                    }
                }
                Command::Cancel => {
                    if !session.supervisor().cancel_turn() {
                        tracing::debug!("cancel requested with no active turn");
                    }
                }
                Command::Clear => {
                    if job_tx.send(Job::Clear).is_err() {
                        break;
                    }
                }
                Command::Quit => break,
            }
        }
        session.supervisor().cancel();
        drop(job_tx);
        let _ = worker.await;
        tracing::info!(session = %session.id(), "agent runtime stopped");
    });

    AgentHandle {
        commands: cmd_tx,
        outputs: out_rx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OrchestratorConfig;
    use crate::llm::ScriptedTransport;
    use crate::memory::Message;

    fn mock_config(dir: &tempfile::TempDir) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.app.workspace_root = Some(dir.path().join("ws"));
        cfg
    }

    #[test]
    fn test_build_requires_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = mock_config(&dir);
        cfg.llm.provider = Provider::Openai;
        cfg.llm.api_key_env = Some("PILOT_TEST_KEY_THAT_IS_NEVER_SET".to_string());
        let err = build_orchestrator(&cfg).err().unwrap();
        assert!(matches!(err, AgentError::ConfigError(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_mock_turn_through_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock_config(&dir);
        let orchestrator = Arc::new(build_orchestrator(&cfg).unwrap());
        assert!(dir.path().join("ws").is_dir());
        assert_eq!(
            orchestrator.dispatcher().tool_names(),
            vec!["echo", "list_files", "read_file"]
        );

        let mut handle = spawn_agent(orchestrator.clone());
        handle.commands.send(Command::Submit("hi".into())).unwrap();
        match handle.outputs.recv().await.unwrap() {
            AgentOutput::Reply { input, result } => {
                assert_eq!(input, "hi");
                assert_eq!(result.unwrap(), "Done. Tool said: Echo from Mock: hi");
            }
            other => panic!("unexpected output: {other:?}"),
        }

        handle.commands.send(Command::Clear).unwrap();
        assert!(matches!(handle.outputs.recv().await, Some(AgentOutput::Cleared)));
        assert_eq!(orchestrator.recent_turns(10).await.len(), 0);

        handle.commands.send(Command::Quit).unwrap();
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_turn_only() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(Message::assistant("slow"))
                .reply(Message::assistant("fast"))
                .with_latency(Duration::from_millis(300)),
        );
        let orchestrator = Arc::new(
            Orchestrator::new(
                ModelClient::new(transport),
                ToolDispatcher::new(ToolRegistry::<()>::new(), 5),
                Arc::new(()),
            )
            .with_config(OrchestratorConfig::default()),
        );
        let mut handle = spawn_agent(orchestrator);

        handle.commands.send(Command::Submit("first".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.commands.send(Command::Cancel).unwrap();
        match handle.outputs.recv().await.unwrap() {
            AgentOutput::Reply { result, .. } => {
                assert!(matches!(result, Err(AgentError::Cancelled)), "{result:?}")
            }
            other => panic!("unexpected output: {other:?}"),
        }

        // 会话仍可用
        handle.commands.send(Command::Submit("second".into())).unwrap();
        match handle.outputs.recv().await.unwrap() {
            AgentOutput::Reply { result, .. } => assert!(result.is_ok(), "{result:?}"),
            other => panic!("unexpected output: {other:?}"),
        }
        handle.commands.send(Command::Quit).unwrap();
        handle.task.await.unwrap();
    }
}
