//! Echo 工具（测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::tools::{Tool, ToolContext, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoArgs {
    /// 要回显的文本
    pub text: String,
}

/// Echo 工具：原样回显 text，不依赖资源
pub struct EchoTool;

#[async_trait]
impl<R: Send + Sync + 'static> Tool<R> for EchoTool {
    type Args = EchoArgs;

    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back unchanged (for testing)."
    }

    async fn call(&self, args: EchoArgs, _ctx: &ToolContext<R>) -> Result<String, ToolError> {
        Ok(args.text)
    }
}
