//! Pilot - Rust 智能体编排核心
//!
//! 模块划分：
//! - **agent**: 按配置装配编排器，后台命令运行时（Submit / Cancel / Clear）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、轮次状态、会话监管、错误类型
//! - **llm**: 模型传输抽象与实现（OpenAI 兼容 / DeepSeek / Mock），重试退避、流式适配
//! - **memory**: 对话历史与上下文裁剪
//! - **observability**: 日志初始化
//! - **react**: 工具调用循环状态机与过程事件
//! - **tools**: 工具注册表、参数 Schema、并发分发器与内置工具（echo、read_file、list_files）

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
