pub mod dispatcher;
pub mod echo;
pub mod filesystem;
pub mod registry;
pub mod schema;

pub use dispatcher::{ToolDispatcher, ToolError, ToolResult};
pub use echo::EchoTool;
pub use filesystem::{ListFilesTool, ReadFileTool, SafeFs};
pub use registry::{Tool, ToolContext, ToolRegistry, ToolSpec};
pub use schema::{parameters_schema, parse_arguments};
