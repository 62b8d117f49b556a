//! 核心编排层：错误、轮次状态投影、会话监管、主控编排器

pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;

pub use error::AgentError;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use session_supervisor::{Session, SessionSupervisor};
pub use state::{AgentStatistics, TurnPhase, TurnRecord, TurnStatus};
