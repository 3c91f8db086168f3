//! Tool registry and bounded orchestration loop for sita agent turns.
//!
//! The registry owns every tool contract and is the only path through which a
//! tool runs; the orchestrator drives one AGENT turn through the
//! `AWAITING_RESPONSE -> TOOL_REQUESTED -> EXECUTING_TOOLS -> FINAL` machine.
mod cancellation;
mod tool_registry;
mod turn_loop;

pub use cancellation::CancellationToken;
pub use tool_registry::{
    AgentTool, InvocationOutcome, RegistryError, ToolContract, ToolExecutionResult,
    ToolInvocation, ToolInvokeError, ToolRegistry,
};
pub use turn_loop::{
    AgentEvent, LoopState, Orchestrator, OrchestratorConfig, OrchestratorError, TurnOutcome,
    TurnStatus,
};
