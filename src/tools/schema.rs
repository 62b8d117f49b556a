//! 工具参数 Schema 生成与校验（schemars 自动生成，serde 强类型解析）
//!
//! 声明给模型的 parameters 与分发时的校验出自同一个 Args 类型。

use schemars::gen::SchemaGenerator;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::tools::ToolError;

/// 错误信息中引用原始参数的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

/// 生成 T 的 JSON Schema（去掉 $schema / title，仅保留对象结构）
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let root = SchemaGenerator::default().into_root_schema_for::<T>();
    let mut schema = serde_json::to_value(root).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        obj.entry("type").or_insert_with(|| Value::String("object".into()));
    }
    schema
}

/// 解析原始参数文本为 T；空串视为 {}。失败时错误中引用畸形输入
pub fn parse_arguments<T: DeserializeOwned>(tool: &str, raw: &str) -> Result<T, ToolError> {
    let raw = raw.trim();
    let raw = if raw.is_empty() { "{}" } else { raw };

    let value: Value = serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: format!("malformed JSON ({e}); input: {}", preview(raw)),
    })?;
    serde_json::from_value(value).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: format!("{e}; input: {}", preview(raw)),
    })
}

pub(crate) fn preview(s: &str) -> String {
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}
