//! 工具调用循环：有界状态机与过程事件

pub mod events;
pub mod loop_;

pub use events::TurnEvent;
pub use loop_::{run_turn_loop, TurnContext, TurnProgress};
