pub mod agent_loop;
pub mod session;

pub use agent_loop::{AgentResult, StopReason, ToolCallSummary, TurnTrace};
pub use session::{Session, SessionCoordinator};
