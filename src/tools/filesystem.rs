//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ReadFileTool / ListFilesTool 以 SafeFs 作为资源句柄。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::tools::{Tool, ToolContext, ToolError};

/// 读取结果的最大字节数，超出部分截断
const MAX_READ_BYTES: usize = 64 * 1024;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 检查路径是否在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let path = path.trim_start_matches("./");
        let canonical = self
            .root_dir
            .join(path)
            .canonicalize()
            .map_err(|_| ToolError::Execution(format!("Path not found: {path}")))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(ToolError::PathEscape(path.to_string())) // 如 ../../etc/passwd
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<String, ToolError> {
        let resolved = self.resolve(path)?;
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| ToolError::Execution(format!("Read failed: {e}")))?;
        let mut text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_READ_BYTES)]).into_owned();
        if bytes.len() > MAX_READ_BYTES {
            text.push_str(&format!("\n... [truncated, {} bytes total]", bytes.len()));
        }
        Ok(text)
    }

    /// 目录项按名排序，目录带 / 后缀，隐藏文件跳过
    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, ToolError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut dir = tokio::fs::read_dir(&base)
            .await
            .map_err(|e| ToolError::Execution(format!("List failed: {e}")))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        Ok(entries)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// 相对工作区的文件路径
    pub path: String,
}

/// read_file 工具：读取文件内容
pub struct ReadFileTool;

#[async_trait]
impl Tool<SafeFs> for ReadFileTool {
    type Args = ReadFileArgs;

    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file inside the workspace."
    }

    async fn call(&self, args: ReadFileArgs, ctx: &ToolContext<SafeFs>) -> Result<String, ToolError> {
        tracing::debug!(path = %args.path, call_id = %ctx.call_id, "read_file");
        ctx.resource.read_file(&args.path).await
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListFilesArgs {
    /// 相对工作区的目录，默认 "."
    #[serde(default)]
    pub path: Option<String>,
}

/// list_files 工具：列出目录
pub struct ListFilesTool;

#[async_trait]
impl Tool<SafeFs> for ListFilesTool {
    type Args = ListFilesArgs;

    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List entries of a directory inside the workspace. Directories end with '/'."
    }

    async fn call(&self, args: ListFilesArgs, ctx: &ToolContext<SafeFs>) -> Result<String, ToolError> {
        let path = args.path.unwrap_or_else(|| ".".to_string());
        tracing::debug!(path = %path, call_id = %ctx.call_id, "list_files");
        let entries = ctx.resource.list_dir(&path).await?;
        if entries.is_empty() {
            return Ok("(empty directory)".to_string());
        }
        Ok(entries.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::memory::ToolCall;
    use crate::tools::{ToolDispatcher, ToolRegistry};

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello workspace").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_read_and_list_inside_root() {
        let dir = workspace();
        let fs = SafeFs::new(dir.path());
        assert_eq!(fs.read_file("./notes.txt").await.unwrap(), "hello workspace");
        assert_eq!(fs.list_dir(".").await.unwrap(), vec!["notes.txt", "src/"]);
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let dir = workspace();
        let inner = dir.path().join("src");
        let fs = SafeFs::new(&inner);
        let err = fs.read_file("../notes.txt").await.unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)), "{err:?}");
        assert!(matches!(
            fs.read_file("missing.txt").await,
            Err(ToolError::Execution(_))
        ));
    }

    #[tokio::test]
    async fn test_tools_through_dispatcher() {
        let dir = workspace();
        let fs = Arc::new(SafeFs::new(dir.path()));
        let mut registry = ToolRegistry::new();
        registry.register(ReadFileTool);
        registry.register(ListFilesTool);
        let dispatcher = ToolDispatcher::new(registry, 5);
        let cancel = CancellationToken::new();

        let r = dispatcher
            .dispatch(&ToolCall::new("c1", "list_files", "{}"), fs.clone(), &cancel)
            .await;
        assert_eq!(r.content, "notes.txt\nsrc/");

        let r = dispatcher
            .dispatch(&ToolCall::new("c2", "read_file", r#"{"path":"notes.txt"}"#), fs.clone(), &cancel)
            .await;
        assert!(!r.is_error);
        assert_eq!(r.content, "hello workspace");

        let r = dispatcher
            .dispatch(&ToolCall::new("c3", "read_file", r#"{"path":"../../etc/passwd"}"#), fs, &cancel)
            .await;
        assert!(r.is_error);
    }
}
