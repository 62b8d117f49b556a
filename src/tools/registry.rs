//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / 强类型 Args / call），由 ToolRegistry 按名注册与 O(1) 查找；
//! 参数 JSON 在分发边界按 Args 类型解析与校验，handler 只接收已校验的参数。R 为工具操作的外部资源句柄。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tools::schema::{parameters_schema, parse_arguments};
use crate::tools::ToolError;

/// 发给模型的工具声明（name / description / 参数 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 单次调用的上下文：资源句柄、取消令牌（尽力中止）、调用 id
pub struct ToolContext<R> {
    pub resource: Arc<R>,
    pub cancel: CancellationToken,
    pub call_id: String,
}

impl<R> Clone for ToolContext<R> {
    fn clone(&self) -> Self {
        Self {
            resource: Arc::clone(&self.resource),
            cancel: self.cancel.clone(),
            call_id: self.call_id.clone(),
        }
    }
}

/// 工具 trait：同一分发步骤内可能与其它 handler 并发调用
#[async_trait]
pub trait Tool<R>: Send + Sync {
    /// 参数类型；其 JSON Schema 即声明给模型的 parameters
    type Args: DeserializeOwned + JsonSchema + Send;

    /// 工具名称（模型 tool_call 中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    async fn call(&self, args: Self::Args, ctx: &ToolContext<R>) -> Result<String, ToolError>;
}

/// 擦除 Args 类型后的工具，供注册表统一存放
#[async_trait]
pub(crate) trait ErasedTool<R>: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    async fn invoke(&self, raw_arguments: &str, ctx: &ToolContext<R>) -> Result<String, ToolError>;
}

struct TypedTool<T> {
    tool: T,
    spec: ToolSpec,
}

#[async_trait]
impl<R, T> ErasedTool<R> for TypedTool<T>
where
    R: Send + Sync + 'static,
    T: Tool<R> + 'static,
{
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn invoke(&self, raw_arguments: &str, ctx: &ToolContext<R>) -> Result<String, ToolError> {
        let args = parse_arguments::<T::Args>(&self.spec.name, raw_arguments)?;
        self.tool.call(args, ctx).await
    }
}

/// 工具注册表：按名称存储，支持 register / contains / specs / tool_names
pub struct ToolRegistry<R> {
    tools: HashMap<String, Arc<dyn ErasedTool<R>>>,
}

impl<R> Default for ToolRegistry<R> {
    fn default() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }
}

impl<R: Send + Sync + 'static> ToolRegistry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具被替换
    pub fn register<T: Tool<R> + 'static>(&mut self, tool: T) {
        let spec = ToolSpec {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: parameters_schema::<T::Args>(),
        };
        if self.tools.contains_key(&spec.name) {
            tracing::warn!(tool = %spec.name, "tool re-registered, replacing previous handler");
        }
        self.tools
            .insert(spec.name.clone(), Arc::new(TypedTool { tool, spec }));
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ErasedTool<R>>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 按名称排序，保证请求体稳定
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec().clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 工具 schema JSON（日志与调试用）
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.specs()).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
