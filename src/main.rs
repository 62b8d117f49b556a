//! Pilot - 命令行入口
//!
//! 初始化日志、加载配置、装配编排器，然后在标准输入上运行 REPL。
//! `/clear` 清空对话，`/stats` 查看统计，`/cancel` 或 Ctrl-C 打断当前轮次，`/quit` 退出。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use pilot::agent::{build_orchestrator, spawn_agent, AgentHandle, AgentOutput, Command};
use pilot::config::load_config;
use pilot::observability;
use pilot::react::TurnEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let streaming = cfg.agent.streaming;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TurnEvent>();
    let orchestrator = Arc::new(
        build_orchestrator(&cfg)
            .context("Failed to build orchestrator")?
            .with_event_sender(event_tx),
    );
    let AgentHandle {
        commands,
        mut outputs,
        task,
    } = spawn_agent(orchestrator.clone());

    // 过程事件：流式文本直接写 stdout，工具活动写 stderr
    tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            match ev {
                TurnEvent::MessageChunk { text } => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                TurnEvent::ToolCall { tool, arguments, .. } => {
                    eprintln!("[tool] {tool} {arguments}");
                }
                TurnEvent::Observation {
                    tool,
                    preview,
                    is_error,
                    ..
                } => {
                    let tag = if is_error { "error" } else { "ok" };
                    eprintln!("[{tag}] {tool}: {preview}");
                }
                _ => {}
            }
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(output) = outputs.recv().await {
            match output {
                AgentOutput::Reply { result: Ok(text), .. } => {
                    if streaming {
                        println!();
                    } else {
                        println!("{text}");
                    }
                }
                AgentOutput::Reply { result: Err(e), .. } => eprintln!("error: {e}"),
                AgentOutput::Cleared => println!("(conversation cleared)"),
            }
        }
    });

    println!(
        "pilot ({}) ready. /clear /stats /cancel /quit",
        orchestrator.client().transport_name()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                let command = match line.trim() {
                    "" => continue,
                    "/quit" | "/exit" => break,
                    "/clear" => Command::Clear,
                    "/cancel" => Command::Cancel,
                    "/stats" => {
                        let stats = orchestrator.statistics().await;
                        println!(
                            "turns: {} (ok {}, failed {}), success rate {:.1}%, avg {:?}",
                            stats.total_turns,
                            stats.completed_turns,
                            stats.failed_turns,
                            stats.success_rate(),
                            stats.average_execution_time(),
                        );
                        continue;
                    }
                    input => Command::Submit(input.to_string()),
                };
                commands.send(command).context("Agent runtime stopped")?;
            }
            _ = tokio::signal::ctrl_c() => {
                commands.send(Command::Cancel).context("Agent runtime stopped")?;
            }
        }
    }

    let _ = commands.send(Command::Quit);
    task.await.context("Agent runtime panicked")?;
    printer.await.context("Output printer panicked")?;
    Ok(())
}
